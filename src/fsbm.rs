//! Two-bit free space bitmap.
//!
//! Each logical page of the file system area owns two bits: bit 0 is the
//! "free" bit, bit 1 the "not to be released" bit. Both start in the erased
//! polarity and are only ever flipped toward the programmed polarity, so
//! every state transition (free → used → to-be-released) is a plain
//! program operation. The illegal fourth state (free but to-be-released)
//! is rejected by the marking functions.

use crate::addr::PageAddr;
use crate::cache::Media;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::header::{BlockType, Header};

/// Target state for [`mark_pages`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mark {
    Used,
    ToBeReleased,
}

/// Where the two bits of a page live inside the bitmap.
struct BitLocation {
    page: PageAddr,
    byte_offset: usize,
    bit: u32,
}

fn bit_location<D: FlashDevice>(
    media: &Media<D>,
    header: &Header,
    addr: PageAddr,
) -> Result<BitLocation> {
    if !addr.is_valid() {
        log::error!("invalid address {addr} in bitmap lookup");
        return Err(Error::InternalRange);
    }
    let geo = &media.layout.geo;
    let bit_pos = (addr.block - geo.reserved_blocks) as usize * geo.pages_per_block as usize * 2
        + addr.page as usize * 2;
    let page_bits = geo.page_bytes * 8;
    let page = header.fsbm.add(geo, bit_pos / page_bits)?;
    Ok(BitLocation {
        page,
        byte_offset: bit_pos % page_bits / 8,
        bit: (bit_pos % 8) as u32,
    })
}

fn bit_is_erased(byte: u8, bit: u32, erased: u8) -> bool {
    (byte >> bit) & 1 == erased & 1
}

fn program_bit(byte: u8, bit: u32, erased: u8) -> u8 {
    if erased == 0xFF {
        byte & !(1 << bit)
    } else {
        byte | (1 << bit)
    }
}

/// Page is free: its free bit is still erased.
pub(crate) fn is_page_free<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    addr: PageAddr,
) -> Result<bool> {
    let erased = media.layout.erased_byte();
    let loc = bit_location(media, header, addr)?;
    let mut byte = [0u8; 1];
    media.read(loc.page, loc.byte_offset, &mut byte)?;
    Ok(bit_is_erased(byte[0], loc.bit, erased))
}

/// Page is awaiting release: its not-to-be-released bit is programmed.
pub(crate) fn is_page_to_be_released<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    addr: PageAddr,
) -> Result<bool> {
    let erased = media.layout.erased_byte();
    let loc = bit_location(media, header, addr)?;
    let mut byte = [0u8; 1];
    media.read(loc.page, loc.byte_offset, &mut byte)?;
    Ok(!bit_is_erased(byte[0], loc.bit + 1, erased))
}

/// Flip `count` pages starting at `addr` to used or to-be-released.
///
/// Both transitions are single monotonic bit flips; marking a page that is
/// already in the requested state (or skipping a state) is an allocator
/// invariant violation and fails with `InternalAllocation`.
pub(crate) fn mark_pages<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    addr: PageAddr,
    count: usize,
    mark: Mark,
) -> Result<()> {
    let erased = media.layout.erased_byte();
    let mut addr = addr;
    for i in 0..count {
        log::trace!("mark {addr} {mark:?}");
        let loc = bit_location(media, header, addr)?;
        let mut byte = [0u8; 1];
        media.read(loc.page, loc.byte_offset, &mut byte)?;
        let is_free = bit_is_erased(byte[0], loc.bit, erased);
        let not_released = bit_is_erased(byte[0], loc.bit + 1, erased);
        let new = match mark {
            Mark::Used => {
                if !is_free {
                    log::error!("page {addr} is already allocated");
                    return Err(Error::InternalAllocation);
                }
                program_bit(byte[0], loc.bit, erased)
            }
            Mark::ToBeReleased => {
                if is_free {
                    log::error!("page {addr} has not been allocated");
                    return Err(Error::InternalAllocation);
                }
                if !not_released {
                    log::error!("page {addr} is already marked to be released");
                    return Err(Error::InternalAllocation);
                }
                program_bit(byte[0], loc.bit + 1, erased)
            }
        };
        media.write(loc.page, loc.byte_offset, &[new])?;
        if i + 1 < count {
            addr = addr.next(&media.layout.geo)?;
        }
    }
    media.flush()
}

/// Whether a run may cross block boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunScope {
    /// Runs may span blocks freely.
    Any,
    /// Runs must start at a block boundary and cover whole blocks.
    AlignedBlocks,
}

/// Search request for [`find_pages`].
pub(crate) struct Find {
    pub min: usize,
    pub desired: usize,
    pub block_type: BlockType,
    /// `true`: look for free pages, `false`: look for to-be-released pages.
    pub free: bool,
    pub scope: RunScope,
    pub start_block: u16,
    /// Confine the scan to `start_block` alone. The wear-biased allocator
    /// probes its preferred blocks this way before falling back to a full
    /// scan.
    pub only_start_block: bool,
}

/// Scan the bitmap for a run of at least `min`, up to `desired` pages.
///
/// The scan starts at `start_block` and walks to the end of the device; it
/// does not wrap. Returns the run start and its length. With
/// `check_erased_pages` enabled, a free-marked page that is not physically
/// erased is reported and skipped.
pub(crate) fn find_pages<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    find: &Find,
) -> Result<(PageAddr, usize)> {
    let geo = media.layout.geo;
    let erased = media.layout.erased_byte();
    let check_erased = media.layout.cfg.check_erased_pages;
    let ppb = geo.pages_per_block as usize;

    let start_block = find.start_block.clamp(geo.reserved_blocks, geo.blocks - 1);
    let mut addr = PageAddr::new(start_block, 0);
    let mut run_start = PageAddr::INVALID;
    let mut run_len = 0usize;
    let mut best: Option<(PageAddr, usize)> = None;
    let mut block_ok = header.is_block_type(&media.layout, addr.block, find.block_type);

    loop {
        let loc = bit_location(media, header, addr)?;
        let mut byte = [0u8; 1];
        media.read(loc.page, loc.byte_offset, &mut byte)?;

        let mut candidate = block_ok
            && if find.free {
                bit_is_erased(byte[0], loc.bit, erased)
            } else {
                !bit_is_erased(byte[0], loc.bit + 1, erased)
            };
        if candidate && find.free && check_erased && !media.is_page_erased(addr)? {
            log::error!("page {addr} is marked free but not erased");
            candidate = false;
        }
        if candidate && find.scope == RunScope::AlignedBlocks && run_len == 0 && addr.page != 0 {
            // An aligned run cannot start in the middle of a block
            candidate = false;
        }

        if candidate {
            if run_len == 0 {
                run_start = addr;
            }
            run_len += 1;
            if run_len >= find.min {
                best = Some((run_start, run_len));
            }
            if run_len >= find.desired {
                return Ok((run_start, run_len));
            }
        } else {
            run_len = 0;
        }

        // Advance, recomputing the block predicate on block crossings
        if addr.page as usize + 1 == ppb {
            if find.only_start_block || addr.block + 1 >= geo.blocks {
                break;
            }
            addr = PageAddr::new(addr.block + 1, 0);
            block_ok = header.is_block_type(&media.layout, addr.block, find.block_type);
        } else {
            addr.page += 1;
        }
    }

    best.ok_or(Error::NoMoreSpace)
}

/// Find `count` consecutive whole free blocks of the given type.
pub(crate) fn find_free_blocks<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    count: usize,
    block_type: BlockType,
    start_block: u16,
) -> Result<u16> {
    let ppb = media.layout.geo.pages_per_block as usize;
    let (addr, _) = find_pages(
        media,
        header,
        &Find {
            min: count * ppb,
            desired: count * ppb,
            block_type,
            free: true,
            scope: RunScope::AlignedBlocks,
            start_block,
            only_start_block: false,
        },
    )?;
    Ok(addr.block)
}

/// True when every page of `block` is marked to-be-released.
pub(crate) fn is_block_fully_tbr<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
) -> Result<bool> {
    let ppb = media.layout.geo.pages_per_block;
    for page in 0..ppb {
        if !is_page_to_be_released(media, header, PageAddr::new(block, page))? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Free or to-be-released page counts, split into management and data.
///
/// Only primary management pages are counted on the management side;
/// the secondary area is merge working space, not allocatable.
pub(crate) fn count_pages<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    free: bool,
) -> Result<(usize, usize)> {
    let geo = media.layout.geo;
    let erased = media.layout.erased_byte();
    let check_erased = media.layout.cfg.check_erased_pages;
    let mut mgmt = 0usize;
    let mut data = 0usize;

    for block in geo.reserved_blocks..geo.blocks {
        let block_type = header.block_type(&media.layout, block);
        if !matches!(block_type, BlockType::Data | BlockType::PrimaryMgmt) {
            continue;
        }
        for page in 0..geo.pages_per_block {
            let addr = PageAddr::new(block, page);
            let loc = bit_location(media, header, addr)?;
            let mut byte = [0u8; 1];
            media.read(loc.page, loc.byte_offset, &mut byte)?;
            let mut hit = if free {
                bit_is_erased(byte[0], loc.bit, erased)
            } else {
                !bit_is_erased(byte[0], loc.bit + 1, erased)
            };
            if hit && free && check_erased && !media.is_page_erased(addr)? {
                log::error!("page {addr} is marked free but not erased");
                hit = false;
            }
            if hit {
                match block_type {
                    BlockType::Data => data += 1,
                    BlockType::PrimaryMgmt => mgmt += 1,
                    _ => {}
                }
            }
        }
    }
    Ok((mgmt, data))
}

/// Free page count within a single block.
pub(crate) fn count_free_in_block<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    block: u16,
) -> Result<usize> {
    let geo = media.layout.geo;
    let erased = media.layout.erased_byte();
    let mut n = 0;
    for page in 0..geo.pages_per_block {
        let loc = bit_location(media, header, PageAddr::new(block, page))?;
        let mut byte = [0u8; 1];
        media.read(loc.page, loc.byte_offset, &mut byte)?;
        if bit_is_erased(byte[0], loc.bit, erased) {
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Layout};
    use crate::header;
    use crate::sim::SimulatedNorFlash;

    type Flash = SimulatedNorFlash<256, 64, 8>;

    fn setup() -> (Media<Flash>, Header) {
        let dev = Flash::new();
        let layout = Layout::new(&dev, &Config::new()).unwrap();
        let mut media = Media::new(dev, layout.clone());
        let h = Header::init(&layout, 0, 0, 1).unwrap();
        header::write_header(&mut media, &h, true, true).unwrap();
        (media, h)
    }

    #[test]
    fn marking_walks_the_legal_state_machine() {
        let (mut media, h) = setup();
        let addr = PageAddr::new(2, 5);
        assert!(is_page_free(&mut media, &h, addr).unwrap());
        assert!(!is_page_to_be_released(&mut media, &h, addr).unwrap());

        mark_pages(&mut media, &h, addr, 1, Mark::Used).unwrap();
        assert!(!is_page_free(&mut media, &h, addr).unwrap());
        assert!(!is_page_to_be_released(&mut media, &h, addr).unwrap());

        mark_pages(&mut media, &h, addr, 1, Mark::ToBeReleased).unwrap();
        assert!(is_page_to_be_released(&mut media, &h, addr).unwrap());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (mut media, h) = setup();
        let addr = PageAddr::new(2, 0);
        // Releasing a free page skips a state
        assert_eq!(
            mark_pages(&mut media, &h, addr, 1, Mark::ToBeReleased),
            Err(Error::InternalAllocation)
        );
        mark_pages(&mut media, &h, addr, 1, Mark::Used).unwrap();
        assert_eq!(
            mark_pages(&mut media, &h, addr, 1, Mark::Used),
            Err(Error::InternalAllocation)
        );
        mark_pages(&mut media, &h, addr, 1, Mark::ToBeReleased).unwrap();
        assert_eq!(
            mark_pages(&mut media, &h, addr, 1, Mark::ToBeReleased),
            Err(Error::InternalAllocation)
        );
    }

    #[test]
    fn find_skips_allocated_pages_and_respects_block_type() {
        let (mut media, h) = setup();
        // Occupy the first three data pages
        mark_pages(&mut media, &h, PageAddr::new(2, 0), 3, Mark::Used).unwrap();
        let (addr, found) = find_pages(
            &mut media,
            &h,
            &Find {
                min: 1,
                desired: 4,
                block_type: BlockType::Data,
                free: true,
                scope: RunScope::Any,
                start_block: 0,
                only_start_block: false,
            },
        )
        .unwrap();
        // Blocks 0 and 1 are management areas, the hole starts past the
        // allocated prefix of block 2
        assert_eq!(addr, PageAddr::new(2, 3));
        assert_eq!(found, 4);
    }

    #[test]
    fn find_returns_a_shorter_run_when_desired_is_not_available() {
        let (mut media, h) = setup();
        // Leave only two free pages at the very end of the device
        mark_pages(&mut media, &h, PageAddr::new(7, 62), 2, Mark::Used).unwrap();
        let (addr, found) = find_pages(
            &mut media,
            &h,
            &Find {
                min: 1,
                desired: 100,
                block_type: BlockType::Data,
                free: true,
                scope: RunScope::Any,
                start_block: 7,
                only_start_block: true,
            },
        )
        .unwrap();
        assert_eq!(addr, PageAddr::new(7, 0));
        assert_eq!(found, 62);
    }

    #[test]
    fn tbr_search_finds_released_pages() {
        let (mut media, h) = setup();
        mark_pages(&mut media, &h, PageAddr::new(3, 10), 2, Mark::Used).unwrap();
        mark_pages(&mut media, &h, PageAddr::new(3, 10), 2, Mark::ToBeReleased).unwrap();
        let (addr, found) = find_pages(
            &mut media,
            &h,
            &Find {
                min: 2,
                desired: 2,
                block_type: BlockType::Data,
                free: false,
                scope: RunScope::Any,
                start_block: 0,
                only_start_block: false,
            },
        )
        .unwrap();
        assert_eq!(addr, PageAddr::new(3, 10));
        assert_eq!(found, 2);
    }

    #[test]
    fn whole_block_search_is_aligned() {
        let (mut media, h) = setup();
        // A single used page makes block 2 unusable for a whole-block run
        mark_pages(&mut media, &h, PageAddr::new(2, 63), 1, Mark::Used).unwrap();
        let block = find_free_blocks(&mut media, &h, 1, BlockType::Data, 2).unwrap();
        assert_eq!(block, 3);
    }

    #[test]
    fn counts_split_management_and_data() {
        let (mut media, h) = setup();
        let (mgmt, data) = count_pages(&mut media, &h, true).unwrap();
        // One management block minus the pages the header reserved
        let layout = media.layout.clone();
        assert_eq!(mgmt, 64 - layout.mgmt_pages_min());
        assert_eq!(data, 6 * 64);
        assert_eq!(count_free_in_block(&mut media, &h, 2).unwrap(), 64);

        mark_pages(&mut media, &h, PageAddr::new(2, 0), 4, Mark::Used).unwrap();
        let (_, data_after) = count_pages(&mut media, &h, true).unwrap();
        assert_eq!(data_after, 6 * 64 - 4);
        assert_eq!(count_free_in_block(&mut media, &h, 2).unwrap(), 60);
    }

    #[test]
    fn free_marked_but_programmed_pages_are_reported_and_skipped() {
        let (mut media, h) = setup();
        // Scribble on a page without marking it used
        media.write(PageAddr::new(2, 0), 0, &[0u8; 256]).unwrap();
        media.flush().unwrap();
        let (addr, _) = find_pages(
            &mut media,
            &h,
            &Find {
                min: 1,
                desired: 1,
                block_type: BlockType::Data,
                free: true,
                scope: RunScope::Any,
                start_block: 0,
                only_start_block: false,
            },
        )
        .unwrap();
        assert_eq!(addr, PageAddr::new(2, 1));
    }
}
