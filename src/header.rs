use crate::addr::{self, FIELD_ERASED, PageAddr};
use crate::cache::Media;
use crate::config::Layout;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::fsbm;

pub(crate) const MAGIC: u32 = 0x4E4F_5246;
pub(crate) const MAJOR_VERSION: u8 = 1;
pub(crate) const MINOR_VERSION: u8 = 0;

const CHECKSUM_ERASED: u32 = u32::MAX;

// Fixed field offsets of the encoded header.
const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = 4;
const OFF_MINOR: usize = 5;
const OFF_COUNTER: usize = 6;
const OFF_BLOCKS: usize = 10;
const OFF_RESERVED: usize = 12;
const OFF_PAGES_PER_BLOCK: usize = 14;
const OFF_PAGE_BYTES: usize = 16;
const OFF_FILENAME_LEN: usize = 18;
const OFF_MAX_ENTRIES: usize = 20;
const OFF_USER_DATA: usize = 22;
const OFF_MGMT_BLOCKS: usize = 24;
const OFF_LEAST_WEARED: usize = 25;
const OFF_DELTA_PAGES: usize = 26;
const OFF_FLAGS: usize = 27;
const OFF_MGMT_BLOCK: usize = 28;
const OFF_NEXT_MGMT_BLOCK: usize = 30;
const OFF_ENTRY_LIST: usize = 32;
const OFF_FSBM: usize = 36;
const OFF_DELTA_MAP: usize = 40;
const OFF_WEAR_LIST: usize = 44;
const OFF_LW_ARRAY: usize = 48;

const FLAG_DELTA_FOR_ENTRIES: u8 = 1 << 0;

/// Encoded header size for a given least-weared list length.
pub(crate) fn header_bytes(least_weared: usize) -> usize {
    OFF_LW_ARRAY + least_weared * 4 + 2 + 4
}

/// Wear summary of one block as carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WearSummary {
    pub block: u16,
    pub counter: u16,
}

impl WearSummary {
    pub const ERASED: WearSummary = WearSummary {
        block: FIELD_ERASED,
        counter: u16::MAX,
    };
}

/// Anchor record of one management area.
#[derive(Clone, Debug)]
pub(crate) struct Header {
    pub counter: u32,
    pub management_block: u16,
    /// Start block of the next (secondary) management area.
    /// `FIELD_ERASED` while a merge has not assigned one yet. Excluded from
    /// the checksum so it can be committed in place afterwards.
    pub next_management_block: u16,
    pub entry_list: PageAddr,
    pub fsbm: PageAddr,
    pub delta_map: PageAddr,
    pub wear_list: PageAddr,
    pub least_weared: Vec<WearSummary>,
    pub wear_cntr_max: u16,
    /// Checksum of the stored copy validated at decode time.
    pub committed: bool,
}

/// Management region classification used by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockType {
    PrimaryMgmt,
    SecondaryMgmt,
    Data,
    Reserved,
    Any,
}

impl Header {
    /// Lay out a fresh header for a management area starting at `block`.
    ///
    /// Region addresses follow the committed order: header, entry list,
    /// free space bitmap, delta map, wear level list.
    pub fn init(layout: &Layout, block: u16, counter: u32, next_mgmt: u16) -> Result<Header> {
        let ppb = layout.geo.pages_per_block as usize;
        let at = |page_index: usize| {
            PageAddr::new(block + (page_index / ppb) as u16, (page_index % ppb) as u16)
        };
        if layout.mgmt_pages_min() > layout.cfg.mgmt_blocks as usize * ppb {
            return Err(Error::Configuration);
        }
        let mut index = layout.header_pages;
        let entry_list = at(index);
        index += layout.entry_list_pages;
        let fsbm = at(index);
        index += layout.fsbm_pages;
        let delta_map = at(index);
        index += layout.cfg.delta_map_pages;
        let wear_list = at(index);
        Ok(Header {
            counter,
            management_block: block,
            next_management_block: next_mgmt,
            entry_list,
            fsbm,
            delta_map,
            wear_list,
            least_weared: vec![WearSummary::ERASED; layout.cfg.least_weared_blocks],
            wear_cntr_max: u16::MAX,
            committed: false,
        })
    }

    pub fn encode(&self, layout: &Layout, commit: bool) -> Vec<u8> {
        let mut buf = vec![layout.erased_byte(); header_bytes(layout.cfg.least_weared_blocks)];
        addr::put_u32(&mut buf, OFF_MAGIC, MAGIC);
        buf[OFF_MAJOR] = MAJOR_VERSION;
        buf[OFF_MINOR] = MINOR_VERSION;
        addr::put_u32(&mut buf, OFF_COUNTER, self.counter);

        let geo = &layout.geo;
        addr::put_u16(&mut buf, OFF_BLOCKS, geo.blocks);
        addr::put_u16(&mut buf, OFF_RESERVED, geo.reserved_blocks);
        addr::put_u16(&mut buf, OFF_PAGES_PER_BLOCK, geo.pages_per_block);
        addr::put_u16(&mut buf, OFF_PAGE_BYTES, geo.page_bytes as u16);
        addr::put_u16(&mut buf, OFF_FILENAME_LEN, layout.cfg.filename_len_max as u16);
        addr::put_u16(&mut buf, OFF_MAX_ENTRIES, layout.cfg.max_entries as u16);
        addr::put_u16(&mut buf, OFF_USER_DATA, layout.cfg.user_data_bytes as u16);
        buf[OFF_MGMT_BLOCKS] = layout.cfg.mgmt_blocks as u8;
        buf[OFF_LEAST_WEARED] = layout.cfg.least_weared_blocks as u8;
        buf[OFF_DELTA_PAGES] = layout.cfg.delta_map_pages as u8;
        buf[OFF_FLAGS] = if layout.cfg.delta_for_entries {
            !FLAG_DELTA_FOR_ENTRIES
        } else {
            !0
        };

        addr::put_u16(&mut buf, OFF_MGMT_BLOCK, self.management_block);
        addr::put_u16(&mut buf, OFF_NEXT_MGMT_BLOCK, self.next_management_block);
        addr::put_addr(&mut buf, OFF_ENTRY_LIST, self.entry_list);
        addr::put_addr(&mut buf, OFF_FSBM, self.fsbm);
        addr::put_addr(&mut buf, OFF_DELTA_MAP, self.delta_map);
        addr::put_addr(&mut buf, OFF_WEAR_LIST, self.wear_list);
        for (i, lw) in self.least_weared.iter().enumerate() {
            addr::put_u16(&mut buf, OFF_LW_ARRAY + i * 4, lw.block);
            addr::put_u16(&mut buf, OFF_LW_ARRAY + i * 4 + 2, lw.counter);
        }
        let lw_end = OFF_LW_ARRAY + self.least_weared.len() * 4;
        addr::put_u16(&mut buf, lw_end, self.wear_cntr_max);
        let checksum = if commit {
            calc_checksum(&buf)
        } else {
            CHECKSUM_ERASED
        };
        addr::put_u32(&mut buf, lw_end + 2, checksum);
        buf
    }

    /// Decode a candidate header page.
    ///
    /// `Ok(None)` when the page does not carry this file system's magic and
    /// version. `Err(Configuration)` when it does but was written with a
    /// different geometry or configuration.
    pub fn decode(buf: &[u8], layout: &Layout) -> Result<Option<Header>> {
        if addr::get_u32(buf, OFF_MAGIC) != MAGIC
            || buf[OFF_MAJOR] != MAJOR_VERSION
            || buf[OFF_MINOR] != MINOR_VERSION
        {
            return Ok(None);
        }
        let geo = &layout.geo;
        let flags = if layout.cfg.delta_for_entries {
            !FLAG_DELTA_FOR_ENTRIES
        } else {
            !0
        };
        if addr::get_u16(buf, OFF_BLOCKS) != geo.blocks
            || addr::get_u16(buf, OFF_RESERVED) != geo.reserved_blocks
            || addr::get_u16(buf, OFF_PAGES_PER_BLOCK) != geo.pages_per_block
            || addr::get_u16(buf, OFF_PAGE_BYTES) != geo.page_bytes as u16
            || addr::get_u16(buf, OFF_FILENAME_LEN) != layout.cfg.filename_len_max as u16
            || addr::get_u16(buf, OFF_MAX_ENTRIES) != layout.cfg.max_entries as u16
            || addr::get_u16(buf, OFF_USER_DATA) != layout.cfg.user_data_bytes as u16
            || buf[OFF_MGMT_BLOCKS] != layout.cfg.mgmt_blocks as u8
            || buf[OFF_LEAST_WEARED] != layout.cfg.least_weared_blocks as u8
            || buf[OFF_DELTA_PAGES] != layout.cfg.delta_map_pages as u8
            || buf[OFF_FLAGS] != flags
        {
            log::error!("header found but written with a different configuration");
            return Err(Error::Configuration);
        }
        let n = layout.cfg.least_weared_blocks;
        let lw_end = OFF_LW_ARRAY + n * 4;
        let stored_checksum = addr::get_u32(buf, lw_end + 2);
        let committed =
            stored_checksum != CHECKSUM_ERASED && stored_checksum == calc_checksum(buf);
        let mut least_weared = Vec::with_capacity(n);
        for i in 0..n {
            least_weared.push(WearSummary {
                block: addr::get_u16(buf, OFF_LW_ARRAY + i * 4),
                counter: addr::get_u16(buf, OFF_LW_ARRAY + i * 4 + 2),
            });
        }
        Ok(Some(Header {
            counter: addr::get_u32(buf, OFF_COUNTER),
            management_block: addr::get_u16(buf, OFF_MGMT_BLOCK),
            next_management_block: addr::get_u16(buf, OFF_NEXT_MGMT_BLOCK),
            entry_list: addr::get_addr(buf, OFF_ENTRY_LIST),
            fsbm: addr::get_addr(buf, OFF_FSBM),
            delta_map: addr::get_addr(buf, OFF_DELTA_MAP),
            wear_list: addr::get_addr(buf, OFF_WEAR_LIST),
            least_weared,
            wear_cntr_max: addr::get_u16(buf, lw_end),
            committed,
        }))
    }

    /// Classify a block relative to this header's management areas.
    pub fn block_type(&self, layout: &Layout, block: u16) -> BlockType {
        if block < layout.geo.reserved_blocks {
            return BlockType::Reserved;
        }
        let mgmt = layout.cfg.mgmt_blocks;
        if block >= self.management_block && block < self.management_block + mgmt {
            return BlockType::PrimaryMgmt;
        }
        if self.next_management_block < FIELD_ERASED - 1
            && block >= self.next_management_block
            && block < self.next_management_block + mgmt
        {
            return BlockType::SecondaryMgmt;
        }
        BlockType::Data
    }

    pub fn is_block_type(&self, layout: &Layout, block: u16, wanted: BlockType) -> bool {
        wanted == BlockType::Any || self.block_type(layout, block) == wanted
    }

    /// Address of the header page itself.
    pub fn address(&self) -> PageAddr {
        PageAddr::new(self.management_block, 0)
    }
}

/// Byte sum over the header, skipping the `next_management_block` field and
/// the checksum itself. Seeded with all-ones so an all-zero header does not
/// checksum to its own erased value.
fn calc_checksum(buf: &[u8]) -> u32 {
    let mut sum = u32::MAX;
    for (i, &b) in buf[..buf.len() - 4].iter().enumerate() {
        if (OFF_NEXT_MGMT_BLOCK..OFF_NEXT_MGMT_BLOCK + 2).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(b as u32);
    }
    sum
}

/// Write a header and, when asked, mark all pages of the management
/// structures it describes as used in the free space bitmap.
pub(crate) fn write_header<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    commit: bool,
    mark_pages: bool,
) -> Result<()> {
    let buf = header.encode(&media.layout, commit);
    media.write(header.address(), 0, &buf)?;
    if mark_pages {
        let layout = media.layout.clone();
        fsbm::mark_pages(
            media,
            header,
            header.address(),
            layout.header_pages,
            fsbm::Mark::Used,
        )?;
        fsbm::mark_pages(
            media,
            header,
            header.entry_list,
            layout.entry_list_pages,
            fsbm::Mark::Used,
        )?;
        fsbm::mark_pages(media, header, header.fsbm, layout.fsbm_pages, fsbm::Mark::Used)?;
        fsbm::mark_pages(
            media,
            header,
            header.delta_map,
            layout.cfg.delta_map_pages,
            fsbm::Mark::Used,
        )?;
        fsbm::mark_pages(
            media,
            header,
            header.wear_list,
            layout.wear_list_pages,
            fsbm::Mark::Used,
        )?;
    }
    log::info!(
        "header written at block {} counter {} committed {}",
        header.management_block,
        header.counter,
        commit
    );
    Ok(())
}

/// Program the `next_management_block` field of a committed header in
/// place. The field is excluded from the checksum, and erased-to-value is
/// always a legal flash transition.
pub(crate) fn commit_next_mgmt<D: FlashDevice>(
    media: &mut Media<D>,
    header: &mut Header,
    next_mgmt: u16,
) -> Result<()> {
    header.next_management_block = next_mgmt;
    media.write(
        header.address(),
        OFF_NEXT_MGMT_BLOCK,
        &next_mgmt.to_le_bytes(),
    )?;
    media.flush()?;
    Ok(())
}
