//! Wear level list and leveling policy.
//!
//! Every block owns a `(counter, tick-bits)` record. An erase flips one
//! tick bit, which is a plain program operation; the merge folds the
//! accumulated ticks into the counter and re-erases the bits. This way the
//! erase log costs one bit flip instead of a counter rewrite.

use crate::addr::{FIELD_ERASED, PageAddr};
use crate::cache::Media;
use crate::config::WEAR_ENTRY_BYTES;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::fsbm;
use crate::header::{BlockType, Header, WearSummary};

/// One wear record with the tick bits still unfolded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WearEntry {
    pub counter: u16,
    pub bits: u8,
}

impl WearEntry {
    /// Counter with the programmed tick bits folded in.
    pub fn effective(&self, erased: u8) -> u16 {
        self.counter
            .saturating_add((self.bits ^ erased).count_ones() as u16)
    }
}

fn entry_location<D: FlashDevice>(
    media: &Media<D>,
    header: &Header,
    block: u16,
) -> Result<(PageAddr, usize)> {
    let geo = &media.layout.geo;
    if block < geo.reserved_blocks || block >= geo.blocks {
        return Err(Error::InternalRange);
    }
    let index = (block - geo.reserved_blocks) as usize;
    let per_page = media.layout.wear_entries_per_page;
    let page = header.wear_list.add(geo, index / per_page)?;
    Ok((page, index % per_page * WEAR_ENTRY_BYTES))
}

fn read_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
) -> Result<WearEntry> {
    let (page, offset) = entry_location(media, header, block)?;
    let mut buf = [0u8; WEAR_ENTRY_BYTES];
    media.read(page, offset, &mut buf)?;
    Ok(WearEntry {
        counter: u16::from_le_bytes([buf[0], buf[1]]),
        bits: buf[2],
    })
}

pub(crate) fn write_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
    entry: WearEntry,
) -> Result<()> {
    let (page, offset) = entry_location(media, header, block)?;
    let mut buf = [0u8; WEAR_ENTRY_BYTES];
    buf[..2].copy_from_slice(&entry.counter.to_le_bytes());
    buf[2] = entry.bits;
    media.write(page, offset, &buf)
}

/// Write the initial list: zero counters, erased tick bits.
pub(crate) fn init_list<D: FlashDevice>(media: &mut Media<D>, header: &Header) -> Result<()> {
    let erased = media.layout.erased_byte();
    let page_bytes = media.layout.geo.page_bytes;
    let per_page = media.layout.wear_entries_per_page;
    let mut buf = vec![erased; page_bytes];
    for i in 0..per_page {
        buf[i * WEAR_ENTRY_BYTES..i * WEAR_ENTRY_BYTES + 2].copy_from_slice(&0u16.to_le_bytes());
        buf[i * WEAR_ENTRY_BYTES + 2] = erased;
    }
    let mut addr = header.wear_list;
    let pages = media.layout.wear_list_pages;
    for i in 0..pages {
        media.write(addr, 0, &buf)?;
        if i + 1 < pages {
            addr = addr.next(&media.layout.geo)?;
        }
    }
    Ok(())
}

/// Effective erase count of a block.
pub(crate) fn get<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
) -> Result<u16> {
    let erased = media.layout.erased_byte();
    let entry = read_entry(media, header, block)?;
    Ok(entry.effective(erased))
}

/// Record one more erase by flipping the lowest still-erased tick bit.
///
/// Returns `false` when all tick bits are spent; the caller should
/// schedule a merge, which folds the bits into the counter.
pub(crate) fn increment<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
) -> Result<bool> {
    let erased = media.layout.erased_byte();
    let mut entry = read_entry(media, header, block)?;
    for i in 0..8 {
        let bit = 1u8 << i;
        if entry.bits & bit == erased & bit {
            entry.bits ^= bit;
            log::trace!("block {block} wear tick bit {i}");
            write_entry(media, header, block, entry)?;
            return Ok(true);
        }
    }
    log::warn!("block {block} has no wear tick bits left");
    Ok(false)
}

/// Merge helper: carry every block's wear over into the new area with the
/// ticks folded and fresh tick bits. `pending` holds erases performed
/// while no wear list was writable.
pub(crate) fn copy_list<D: FlashDevice>(
    media: &mut Media<D>,
    old_header: &Header,
    new_header: &Header,
    pending: &[u16],
) -> Result<()> {
    let erased = media.layout.erased_byte();
    let geo = media.layout.geo;
    for block in geo.reserved_blocks..geo.blocks {
        let entry = read_entry(media, old_header, block)?;
        let extra = pending[(block - geo.reserved_blocks) as usize];
        let folded = WearEntry {
            counter: entry.effective(erased).saturating_add(extra),
            bits: erased,
        };
        write_entry(media, new_header, block, folded)?;
    }
    media.flush()
}

/// Rank data blocks by wear and fill the header's least-weared summary.
pub(crate) fn generate_least_weared<D: FlashDevice>(
    media: &mut Media<D>,
    header: &mut Header,
) -> Result<()> {
    let geo = media.layout.geo;
    let mut ranked: Vec<WearSummary> = Vec::new();
    let mut max = 0;
    for block in geo.reserved_blocks..geo.blocks {
        if header.block_type(&media.layout, block) != BlockType::Data {
            continue;
        }
        let wear = get(media, header, block)?;
        max = max.max(wear);
        ranked.push(WearSummary {
            block,
            counter: wear,
        });
    }
    ranked.sort_by_key(|w| w.counter);
    for (i, slot) in header.least_weared.iter_mut().enumerate() {
        *slot = ranked.get(i).copied().unwrap_or(WearSummary::ERASED);
    }
    header.wear_cntr_max = max;
    Ok(())
}

/// Free-page search biased toward the least-weared blocks recorded in the
/// header, falling back to a whole-device scan.
pub(crate) fn find_free_pages_wl<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    min: usize,
    desired: usize,
    block_type: BlockType,
) -> Result<(PageAddr, usize)> {
    for lw in &header.least_weared {
        if lw.block == FIELD_ERASED || !header.is_block_type(&media.layout, lw.block, block_type) {
            continue;
        }
        let found = fsbm::find_pages(
            media,
            header,
            &fsbm::Find {
                min,
                desired,
                block_type,
                free: true,
                scope: fsbm::RunScope::Any,
                start_block: lw.block,
                only_start_block: true,
            },
        );
        match found {
            Ok(hit) => return Ok(hit),
            Err(Error::NoMoreSpace) => continue,
            Err(e) => return Err(e),
        }
    }
    fsbm::find_pages(
        media,
        header,
        &fsbm::Find {
            min,
            desired,
            block_type,
            free: true,
            scope: fsbm::RunScope::Any,
            start_block: media.layout.geo.reserved_blocks,
            only_start_block: false,
        },
    )
}

/// Character appended to a file name while the static leveler rewrites it.
pub(crate) const TEMP_NAME_CHAR: char = '%';

impl<D: FlashDevice> crate::fs::Fs<D> {
    /// Data blocks with the lowest effective erase counts, as recorded by
    /// the last merge, together with the highest count seen.
    pub fn least_weared(&self) -> (Vec<(u16, u16)>, u16) {
        let blocks = self
            .header
            .least_weared
            .iter()
            .filter(|w| w.block != crate::addr::FIELD_ERASED)
            .map(|w| (w.block, w.counter))
            .collect();
        (blocks, self.header.wear_cntr_max)
    }

    /// Static wear leveling: move files off long-idle low-wear blocks.
    ///
    /// A block pinned by read-only data never gets erased and drags the
    /// wear spread apart. When a least-weared block has no free pages and
    /// lags the most-weared count by more than the configured limit, every
    /// file occupying it is copied to a temporary name and renamed back,
    /// which relocates its pages. At most `max_blocks` blocks are
    /// processed per call.
    pub fn level_wear(&mut self, max_blocks: usize) -> Result<usize> {
        let limit = self.media.layout.cfg.static_wear_limit;
        let mut processed = 0usize;
        for i in 0..self.header.least_weared.len() {
            if processed >= max_blocks {
                break;
            }
            let lw = self.header.least_weared[i];
            if lw.block == crate::addr::FIELD_ERASED {
                continue;
            }
            let diff = self.header.wear_cntr_max.saturating_sub(lw.counter);
            let free = fsbm::count_free_in_block(&mut self.media, &self.header, lw.block)?;
            log::debug!(
                "block {}: wear {} (max {}), {} free pages",
                lw.block,
                lw.counter,
                self.header.wear_cntr_max,
                free
            );
            if free == 0 && diff > limit && self.relocate_block_files(lw.block)? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Rewrite every root file that stores data in `block`. Returns whether
    /// anything was moved.
    fn relocate_block_files(&mut self, block: u16) -> Result<bool> {
        let layout = self.media.layout.clone();
        let capacity = layout.entries_per_page * layout.entry_list_pages;
        let mut names = Vec::new();
        for index in 0..capacity {
            let root = self.header.entry_list;
            let Some(e) = crate::entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                root,
                index,
            )?
            else {
                break;
            };
            if !e.is_deleted() && !e.is_dir() {
                names.push(e.name);
            }
        }

        let mut moved = false;
        for name in names {
            if !self.file_uses_block(&name, block)? {
                continue;
            }
            if name.len() + 1 > layout.cfg.filename_len_max {
                log::warn!("cannot relocate '{name}', temporary name would be too long");
                continue;
            }
            let tmp = format!("{name}{TEMP_NAME_CHAR}");
            log::info!("relocating '{name}' off block {block}");
            self.copy(&name, &tmp)?;
            self.rename(&tmp, &name)?;
            moved = true;
        }
        Ok(moved)
    }

    fn file_uses_block(&mut self, name: &str, block: u16) -> Result<bool> {
        let root = self.header.entry_list;
        let e = crate::entry::find_entry(&mut self.media, &self.header, &mut self.delta, root, name)?;
        let mut uses = false;
        crate::map::walk_file_pages(
            &mut self.media,
            &self.header,
            &mut self.delta,
            &e,
            |_, _, _, v| {
                if !v.is_map && v.delta.block == block {
                    uses = true;
                }
                Ok(())
            },
        )?;
        Ok(uses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_count_folds_programmed_ticks() {
        let e = WearEntry {
            counter: 5,
            bits: 0b1111_1000,
        };
        assert_eq!(e.effective(0xFF), 8);
        // Inverted polarity: programmed bits are ones
        let e = WearEntry {
            counter: 5,
            bits: 0b0000_0111,
        };
        assert_eq!(e.effective(0x00), 8);
    }
}
