//! In-memory NOR flash for tests and host-side experiments.
//!
//! The simulator enforces real NOR semantics: programming can only move
//! bits toward the programmed polarity, erasing works on whole blocks, and
//! every erase ages the block. Past a configurable cycle budget it starts
//! injecting stuck bits, and an armed "power cut" makes a chosen mutation
//! (and everything after it) fail, which is how the crash-recovery tests
//! interrupt a merge at every page boundary.

use rand::Rng as _;
use rand::SeedableRng;

use crate::device::{DeviceError, DeviceResult, FlashDevice};
use crate::transaction::{Transaction, TransactionLogLevel};

/// Builder for [`SimulatedNorFlash`], including logging and simple wear-out.
pub struct SimulatedNorFlashBuilder {
    minimum_erase_cycles: u32,
    bit_failure_every_x_erases: u32,
    rng_seed: Option<u64>,
    log_level: TransactionLogLevel,
}

impl SimulatedNorFlashBuilder {
    pub fn new() -> Self {
        Self {
            minimum_erase_cycles: u32::MAX,
            bit_failure_every_x_erases: u32::MAX,
            rng_seed: None,
            log_level: TransactionLogLevel::None,
        }
    }

    /// Set the number of erase cycles considered "safe" per block. After
    /// this threshold the simulator may introduce stuck-bit failures.
    pub fn with_minimum_erase_cycles(mut self, cycles: u32) -> Self {
        self.minimum_erase_cycles = cycles;
        self
    }

    /// Configure how frequently a stuck bit is injected past the safe
    /// limit, e.g. `with_failure_rate(100)` injects one failure every 100
    /// erase cycles beyond the threshold.
    pub fn with_failure_rate(mut self, bit_failure_every_x_erases: u32) -> Self {
        self.bit_failure_every_x_erases = bit_failure_every_x_erases;
        self
    }

    /// Make failure injection deterministic by fixing the RNG seed.
    pub fn with_rng_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = Some(rng_seed);
        self
    }

    /// Enable transaction logging at the requested granularity.
    pub fn with_logging(mut self, level: TransactionLogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Build a simulator with the chosen geometry.
    pub fn build<const PAGE: usize, const PAGES: usize, const BLOCKS: usize>(
        &self,
    ) -> SimulatedNorFlash<PAGE, PAGES, BLOCKS> {
        let mut flash = SimulatedNorFlash::with_failures(
            self.minimum_erase_cycles,
            self.bit_failure_every_x_erases,
            self.rng_seed,
        );
        flash.set_logging(self.log_level);
        flash
    }
}

impl Default for SimulatedNorFlashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory NOR flash with `PAGE`-byte pages, `PAGES` pages per block and
/// `BLOCKS` blocks.
pub struct SimulatedNorFlash<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> {
    data: Vec<u8>,
    stuck_at_1_bits: Vec<u8>,
    stuck_at_0_bits: Vec<u8>,
    block_cycles: Vec<u32>,
    read: usize,
    written: usize,
    erased_blocks: usize,
    read_accesses: usize,
    write_accesses: usize,
    erase_accesses: usize,
    log_level: TransactionLogLevel,
    transactions: Vec<Transaction>,
    rng: rand::rngs::SmallRng,
    minimum_safe_erase_cycles: u32,
    bit_failure_every_x_erases: u32,
    /// Mutations still allowed before the armed power cut hits.
    power_cut_in: Option<u32>,
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize>
    SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    /// Create an erased flash (all bits set to 1).
    pub fn new() -> Self {
        let size = PAGE * PAGES * BLOCKS;
        Self {
            data: vec![0xFF; size],
            stuck_at_1_bits: vec![0x00; size],
            stuck_at_0_bits: vec![0x00; size],
            block_cycles: vec![0; BLOCKS],
            read: 0,
            written: 0,
            erased_blocks: 0,
            read_accesses: 0,
            write_accesses: 0,
            erase_accesses: 0,
            log_level: TransactionLogLevel::None,
            transactions: Vec::new(),
            rng: rand::rngs::SmallRng::seed_from_u64(0),
            minimum_safe_erase_cycles: u32::MAX,
            bit_failure_every_x_erases: u32::MAX,
            power_cut_in: None,
        }
    }

    /// Create a flash with a wear-out failure model.
    pub fn with_failures(
        minimum_erase_cycles: u32,
        bit_failure_every_x_erases: u32,
        rng_seed: Option<u64>,
    ) -> Self {
        Self {
            minimum_safe_erase_cycles: minimum_erase_cycles,
            bit_failure_every_x_erases,
            rng: match rng_seed {
                Some(seed) => rand::rngs::SmallRng::seed_from_u64(seed),
                None => rand::rngs::SmallRng::from_os_rng(),
            },
            ..Self::new()
        }
    }

    /// Set the transaction logging level for subsequent operations.
    pub fn set_logging(&mut self, level: TransactionLogLevel) {
        self.log_level = level;
    }

    /// Allow `mutations` further program/erase operations, then fail every
    /// one after that. Models an abrupt power loss.
    pub fn arm_power_cut(&mut self, mutations: u32) {
        self.power_cut_in = Some(mutations);
    }

    /// Power is back; mutations succeed again.
    pub fn clear_power_cut(&mut self) {
        self.power_cut_in = None;
    }

    /// True once an armed power cut has started failing operations.
    pub fn power_cut_hit(&self) -> bool {
        self.power_cut_in == Some(0)
    }

    /// Erase all data and clear statistics and injected failures.
    pub fn reset(&mut self) {
        self.data.fill(0xFF);
        self.reset_stats();
        self.reset_failures();
    }

    /// Clear counters and the transaction log.
    pub fn reset_stats(&mut self) {
        self.read = 0;
        self.written = 0;
        self.erased_blocks = 0;
        self.read_accesses = 0;
        self.write_accesses = 0;
        self.erase_accesses = 0;
        self.transactions.clear();
    }

    /// Remove all injected stuck-bit failures and reset wear counters.
    pub fn reset_failures(&mut self) {
        self.stuck_at_0_bits.fill(0);
        self.stuck_at_1_bits.fill(0);
        self.block_cycles.fill(0);
    }

    /// Total flash capacity in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Total amount of bytes read since last stats reset.
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Total amount of bytes written since last stats reset.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Number of blocks erased since last stats reset.
    pub fn blocks_erased(&self) -> usize {
        self.erased_blocks
    }

    /// Total number of device accesses (reads + programs + erases).
    pub fn total_accesses(&self) -> usize {
        self.read_accesses + self.write_accesses + self.erase_accesses
    }

    /// View the recorded transaction log.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Per-block erase cycle counters for wear analysis.
    pub fn block_erase_cycles(&self) -> &[u32] {
        &self.block_cycles
    }

    /// Raw device contents, for inspection.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    fn byte_offset(block: u16, page: u16, offset: usize) -> usize {
        block as usize * PAGES * PAGE + page as usize * PAGE + offset
    }

    fn check_bounds(block: u16, page: u16, offset: usize, len: usize) -> bool {
        (block as usize) < BLOCKS && (page as usize) < PAGES && offset + len <= PAGE
    }

    fn consume_mutation(&mut self) -> DeviceResult<()> {
        if let Some(left) = self.power_cut_in.as_mut() {
            if *left == 0 {
                return Err(DeviceError::Other);
            }
            *left -= 1;
        }
        Ok(())
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> Default
    for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> FlashDevice
    for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    fn blocks(&self) -> u16 {
        BLOCKS as u16
    }

    fn pages_per_block(&self) -> u16 {
        PAGES as u16
    }

    fn page_bytes(&self) -> usize {
        PAGE
    }

    fn init(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn deinit(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    fn read(&mut self, block: u16, page: u16, offset: usize, buf: &mut [u8]) -> DeviceResult<()> {
        if !Self::check_bounds(block, page, offset, buf.len()) {
            return Err(DeviceError::Read);
        }
        let start = Self::byte_offset(block, page, offset);
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte |= self.stuck_at_1_bits[start + i];
            *byte &= !self.stuck_at_0_bits[start + i];
        }
        if self.log_level != TransactionLogLevel::None {
            self.transactions
                .push(Transaction::read(self.log_level, block, page, offset, buf));
        }
        self.read += buf.len();
        self.read_accesses += 1;
        Ok(())
    }

    fn program(&mut self, block: u16, page: u16, offset: usize, buf: &[u8]) -> DeviceResult<()> {
        if !Self::check_bounds(block, page, offset, buf.len()) {
            return Err(DeviceError::Program);
        }
        self.consume_mutation()?;
        let start = Self::byte_offset(block, page, offset);
        // NOR can only pull bits toward the programmed polarity.
        for (i, &new) in buf.iter().enumerate() {
            let old = self.data[start + i];
            if (old ^ new) & new != 0 {
                return Err(DeviceError::Program);
            }
        }
        for (i, &new) in buf.iter().enumerate() {
            let cell = &mut self.data[start + i];
            *cell &= new;
            *cell |= self.stuck_at_1_bits[start + i];
            *cell &= !self.stuck_at_0_bits[start + i];
        }
        if self.log_level != TransactionLogLevel::None {
            self.transactions.push(Transaction::program(
                self.log_level,
                block,
                page,
                offset,
                buf,
                &self.data[start..start + buf.len()],
            ));
        }
        self.written += buf.len();
        self.write_accesses += 1;
        Ok(())
    }

    fn erase(&mut self, block: u16) -> DeviceResult<()> {
        if block as usize >= BLOCKS {
            return Err(DeviceError::Erase);
        }
        self.consume_mutation()?;
        let start = Self::byte_offset(block, 0, 0);
        let range = start..start + PAGES * PAGE;

        let idx = block as usize;
        self.block_cycles[idx] += 1;
        if self.block_cycles[idx] > self.minimum_safe_erase_cycles
            && (self.block_cycles[idx] - self.minimum_safe_erase_cycles)
                % self.bit_failure_every_x_erases
                == 0
        {
            // Introduce a stuck bit at a random location in the block
            let failure_offset = start + self.rng.random_range(0..PAGES * PAGE);
            let bit = 1u8 << self.rng.random_range(0..8);
            if self.rng.random::<bool>() {
                self.stuck_at_1_bits[failure_offset] |= bit;
            } else {
                self.stuck_at_0_bits[failure_offset] |= bit;
            }
        }

        if self.log_level != TransactionLogLevel::None {
            self.transactions.push(Transaction::erase(
                self.log_level,
                block,
                &self.data[range.clone()],
            ));
        }
        self.data[range.clone()].fill(0xFF);
        for i in range {
            self.data[i] &= !self.stuck_at_0_bits[i];
        }
        self.erased_blocks += 1;
        self.erase_accesses += 1;
        Ok(())
    }
}

/// A lightweight capture of the flash state and statistics for inspection.
#[derive(Clone, Default, Debug)]
pub struct FlashSnapshot {
    /// Full raw contents, if requested via [`SimulatedNorFlash::snapshot`].
    pub data: Option<Vec<u8>>,
    /// Per-block erase cycle counters.
    pub block_cycles: Vec<u32>,
    /// Amount of bytes read so far.
    pub bytes_read: usize,
    /// Amount of bytes written so far.
    pub bytes_written: usize,
    /// Number of blocks erased so far.
    pub blocks_erased: usize,
    /// Total number of accesses (read+program+erase).
    pub total_accesses: usize,
    /// Number of entries in the transaction log.
    pub transactions_len: usize,
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize>
    SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    /// Create a [`FlashSnapshot`]. When `with_data` is `true`, includes contents.
    pub fn snapshot(&self, with_data: bool) -> FlashSnapshot {
        FlashSnapshot {
            data: with_data.then(|| self.data.clone()),
            block_cycles: self.block_cycles.clone(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
            blocks_erased: self.blocks_erased(),
            total_accesses: self.total_accesses(),
            transactions_len: self.transactions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flash = SimulatedNorFlash<256, 4, 2>;

    #[test]
    fn fresh_flash_reads_erased() {
        let mut flash = Flash::new();
        let mut buf = [0u8; 16];
        flash.read(1, 3, 240, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn program_is_an_and_operation() {
        let mut flash = Flash::new();
        flash.program(0, 0, 0, &[0xF0]).unwrap();
        // Same bits again is fine, clearing more bits is fine
        flash.program(0, 0, 0, &[0xF0]).unwrap();
        flash.program(0, 0, 0, &[0x80]).unwrap();
        // Restoring a cleared bit needs an erase
        assert_eq!(flash.program(0, 0, 0, &[0xF0]), Err(DeviceError::Program));
        flash.erase(0).unwrap();
        let mut buf = [0u8; 1];
        flash.read(0, 0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0xFF);
    }

    #[test]
    fn erase_counts_wear_per_block() {
        let mut flash = Flash::new();
        flash.erase(0).unwrap();
        flash.erase(0).unwrap();
        flash.erase(1).unwrap();
        assert_eq!(flash.block_erase_cycles(), &[2, 1]);
    }

    #[test]
    fn power_cut_fails_the_armed_mutation_and_all_later_ones() {
        let mut flash = Flash::new();
        flash.arm_power_cut(1);
        flash.program(0, 0, 0, &[0x00]).unwrap();
        assert!(flash.program(0, 1, 0, &[0x00]).is_err());
        assert!(flash.erase(0).is_err());
        assert!(flash.power_cut_hit());
        // Reads still work, like flash after a reboot
        let mut buf = [0u8; 1];
        flash.read(0, 0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
        flash.clear_power_cut();
        flash.erase(0).unwrap();
    }

    #[test]
    fn wear_out_injects_stuck_bits() {
        let mut flash = SimulatedNorFlashBuilder::new()
            .with_minimum_erase_cycles(10)
            .with_failure_rate(1)
            .with_rng_seed(42)
            .build::<256, 4, 2>();
        for _ in 0..30 {
            flash.erase(0).unwrap();
        }
        let mut buf = vec![0u8; 1024];
        flash.read(0, 0, 0, &mut buf[..256]).unwrap();
        flash.read(0, 1, 0, &mut buf[256..512]).unwrap();
        flash.read(0, 2, 0, &mut buf[512..768]).unwrap();
        flash.read(0, 3, 0, &mut buf[768..]).unwrap();
        assert!(buf.iter().any(|&b| b != 0xFF));
    }
}
