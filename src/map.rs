//! Per-file map chain.
//!
//! A file's pages are described by a doubly-linked chain of map pages
//! allocated from the management area. Each map page carries a small
//! header with the previous/next map address followed by fixed-size
//! `(page-run address, page-run count)` entries. The chain grows at the
//! tail; entries are appended into erased slots and a fresh map page is
//! linked in when the current one is full.

use crate::addr::{self, PageAddr};
use crate::cache::{self, Media};
use crate::config::{MAP_ENTRY_BYTES, MAP_HEADER_BYTES};
use crate::delta::DeltaMap;
use crate::device::FlashDevice;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::file::OpenFile;
use crate::fsbm;
use crate::header::{BlockType, Header};
use crate::wear;

/// Link header at the start of every map page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MapHeader {
    pub prev: PageAddr,
    pub next: PageAddr,
}

impl MapHeader {
    pub const ERASED: MapHeader = MapHeader {
        prev: PageAddr::ERASED,
        next: PageAddr::ERASED,
    };

    pub fn encode(&self) -> [u8; MAP_HEADER_BYTES] {
        let mut buf = [0u8; MAP_HEADER_BYTES];
        addr::put_addr(&mut buf, 0, self.prev);
        addr::put_addr(&mut buf, 4, self.next);
        buf
    }

    pub fn decode(buf: &[u8]) -> MapHeader {
        MapHeader {
            prev: addr::get_addr(buf, 0),
            next: addr::get_addr(buf, 4),
        }
    }
}

/// One page run: `count` consecutive logical pages starting at `addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MapEntry {
    pub addr: PageAddr,
    pub count: u8,
}

impl MapEntry {
    pub fn encode(&self) -> [u8; MAP_ENTRY_BYTES] {
        let mut buf = [0u8; MAP_ENTRY_BYTES];
        addr::put_addr(&mut buf, 0, self.addr);
        buf[4] = self.count;
        buf
    }

    pub fn decode(buf: &[u8]) -> MapEntry {
        MapEntry {
            addr: addr::get_addr(buf, 0),
            count: buf[4],
        }
    }

    pub fn is_erased(&self, erased: u8) -> bool {
        cache::is_buffer_erased(&self.encode(), erased)
    }
}

fn entry_offset(index: usize) -> usize {
    MAP_HEADER_BYTES + index * MAP_ENTRY_BYTES
}

fn read_map_header<D: FlashDevice>(media: &mut Media<D>, addr: PageAddr) -> Result<MapHeader> {
    let mut buf = [0u8; MAP_HEADER_BYTES];
    media.read(addr, 0, &mut buf)?;
    Ok(MapHeader::decode(&buf))
}

fn read_map_entry<D: FlashDevice>(
    media: &mut Media<D>,
    addr: PageAddr,
    index: usize,
) -> Result<MapEntry> {
    let mut buf = [0u8; MAP_ENTRY_BYTES];
    media.read(addr, entry_offset(index), &mut buf)?;
    Ok(MapEntry::decode(&buf))
}

/// Position the file cursor on the first map entry of its chain.
pub(crate) fn read_first_map_entry<D: FlashDevice>(
    media: &mut Media<D>,
    file: &mut OpenFile,
) -> Result<()> {
    file.map_idx = 0;
    file.map_addr = file.entry.first_map;
    file.map_header = read_map_header(media, file.map_addr)?;
    file.map_entry = read_map_entry(media, file.map_addr, 0)?;
    log::trace!(
        "first map entry of '{}': {} x{}",
        file.entry.name,
        file.map_entry.addr,
        file.map_entry.count
    );
    Ok(())
}

/// Advance the file cursor to the next map entry, following the chain when
/// the current page is exhausted. `EndOfFile` when the chain ends.
pub(crate) fn read_next_map_entry<D: FlashDevice>(
    media: &mut Media<D>,
    file: &mut OpenFile,
) -> Result<()> {
    file.map_idx += 1;
    if file.map_idx >= media.layout.map_entries_per_page {
        if !file.map_header.next.is_valid() {
            return Err(Error::EndOfFile);
        }
        file.map_idx = 0;
        file.map_addr = file.map_header.next;
        file.map_header = read_map_header(media, file.map_addr)?;
    }
    file.map_entry = read_map_entry(media, file.map_addr, file.map_idx)?;
    Ok(())
}

/// Whether the file's current map page still has an erased entry slot.
/// The writer uses this to predict if an append will need a fresh map page
/// and therefore a merge check.
pub(crate) fn has_free_map_entry<D: FlashDevice>(
    media: &mut Media<D>,
    file: &OpenFile,
) -> Result<bool> {
    let erased = media.layout.erased_byte();
    for i in 0..media.layout.map_entries_per_page {
        if read_map_entry(media, file.map_addr, i)?.is_erased(erased) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Append a page run to the file's map, linking in a fresh map page from
/// the management area when the current one is full.
pub(crate) fn append_map_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    file: &mut OpenFile,
    run: PageAddr,
    count: u8,
) -> Result<()> {
    let erased = media.layout.erased_byte();
    if !file.map_addr.is_valid() {
        return Err(Error::InternalRange);
    }
    loop {
        if file.map_entry.is_erased(erased) {
            break;
        }
        match read_next_map_entry(media, file) {
            Ok(()) => {}
            Err(Error::EndOfFile) => {
                // Chain is full, link in a fresh map page
                let (fresh, _) =
                    wear::find_free_pages_wl(media, header, 1, 1, BlockType::PrimaryMgmt)?;
                let mut old_header = read_map_header(media, file.map_addr)?;
                old_header.next = fresh;
                media.write(file.map_addr, 0, &old_header.encode())?;
                log::debug!("map page {} full, chaining {fresh}", file.map_addr);

                let new_header = MapHeader {
                    prev: file.map_addr,
                    next: PageAddr::ERASED,
                };
                media.write(fresh, 0, &new_header.encode())?;
                fsbm::mark_pages(media, header, fresh, 1, fsbm::Mark::Used)?;
                file.map_addr = fresh;
                file.map_header = new_header;
                file.map_idx = 0;
                file.map_entry = MapEntry::decode(&[erased; MAP_ENTRY_BYTES]);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let entry = MapEntry { addr: run, count };
    media.write(file.map_addr, entry_offset(file.map_idx), &entry.encode())?;
    file.map_entry = entry;
    log::trace!(
        "map entry #{} of '{}': {run} x{count}",
        file.map_idx,
        file.entry.name
    );
    Ok(())
}

/// One page reference produced by [`walk_file_pages`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct PageVisit {
    /// Address recorded in the map.
    pub addr: PageAddr,
    /// Address after delta resolution; equal to `addr` when no delta is in
    /// effect, [`PageAddr::INVALID`] for map pages.
    pub delta: PageAddr,
    /// The visited page is a map page, not file data.
    pub is_map: bool,
}

/// Enumerate every page belonging to a file: each run's data pages with
/// their delta resolution, and each map page of the chain. Used by
/// release, the static wear leveler and the consistency check.
pub(crate) fn walk_file_pages<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    entry: &Entry,
    mut visit: impl FnMut(&mut Media<D>, &Header, &mut DeltaMap, PageVisit) -> Result<()>,
) -> Result<()> {
    let erased = media.layout.erased_byte();
    let entries_per_page = media.layout.map_entries_per_page;
    let geo = media.layout.geo;
    let mut map_addr = entry.first_map;

    while map_addr.is_valid() {
        let map_header = read_map_header(media, map_addr)?;
        for i in 0..entries_per_page {
            let me = read_map_entry(media, map_addr, i)?;
            if me.is_erased(erased) {
                break;
            }
            if me.count == 0 || me.count as usize > crate::config::MAP_RUN_MAX {
                continue;
            }
            let mut page = me.addr;
            for j in 0..me.count {
                let resolved = dm.resolve(media, header, page)?;
                visit(
                    media,
                    header,
                    dm,
                    PageVisit {
                        addr: page,
                        delta: resolved,
                        is_map: false,
                    },
                )?;
                if j + 1 < me.count {
                    page = page.next(&geo)?;
                }
            }
        }
        visit(
            media,
            header,
            dm,
            PageVisit {
                addr: map_addr,
                delta: PageAddr::INVALID,
                is_map: true,
            },
        )?;
        map_addr = map_header.next;
    }
    Ok(())
}

/// Mark every data, delta and map page of a file to-be-released.
pub(crate) fn release_file_pages<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    entry: &Entry,
) -> Result<()> {
    walk_file_pages(media, header, dm, entry, |media, header, _, v| {
        if v.is_map {
            fsbm::mark_pages(media, header, v.addr, 1, fsbm::Mark::ToBeReleased)
        } else {
            // The resolved page holds the live content; an unresolved
            // original was already marked when its delta was emitted.
            fsbm::mark_pages(media, header, v.delta, 1, fsbm::Mark::ToBeReleased)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Layout};
    use crate::entry::ATTR_ARCHIVE;
    use crate::file::OpenFile;
    use crate::header as hdr;
    use crate::sim::SimulatedNorFlash;

    type Flash = SimulatedNorFlash<256, 64, 8>;

    fn setup() -> (Media<Flash>, Header, DeltaMap, OpenFile) {
        let dev = Flash::new();
        let layout = Layout::new(&dev, &Config::new()).unwrap();
        let mut media = Media::new(dev, layout.clone());
        let h = Header::init(&layout, 0, 0, 1).unwrap();
        hdr::write_header(&mut media, &h, true, true).unwrap();

        // First free management page becomes the file's first map page
        let map_page = PageAddr::new(0, layout.mgmt_pages_min() as u16);
        fsbm::mark_pages(&mut media, &h, map_page, 1, fsbm::Mark::Used).unwrap();
        let mut f = OpenFile::new();
        f.entry = Entry::new("t", ATTR_ARCHIVE, map_page, 8);
        let dm = DeltaMap::new(
            layout.cfg.delta_map_pages,
            layout.geo.page_bytes,
            layout.erased_byte(),
        );
        (media, h, dm, f)
    }

    #[test]
    fn cursor_walks_appended_runs_in_order() {
        let (mut media, h, _, mut f) = setup();
        read_first_map_entry(&mut media, &mut f).unwrap();
        for i in 0..10u16 {
            append_map_entry(&mut media, &h, &mut f, PageAddr::new(2, i * 3), 3).unwrap();
        }
        read_first_map_entry(&mut media, &mut f).unwrap();
        assert_eq!(f.map_entry.addr, PageAddr::new(2, 0));
        assert_eq!(f.map_entry.count, 3);
        for i in 1..10u16 {
            read_next_map_entry(&mut media, &mut f).unwrap();
            assert_eq!(f.map_entry.addr, PageAddr::new(2, i * 3));
        }
        // Past the runs only erased slots remain
        read_next_map_entry(&mut media, &mut f).unwrap();
        assert!(f.map_entry.is_erased(0xFF));
    }

    #[test]
    fn a_full_map_page_chains_a_fresh_one() {
        let (mut media, h, _, mut f) = setup();
        read_first_map_entry(&mut media, &mut f).unwrap();
        let per_page = media.layout.map_entries_per_page;
        let first_map = f.map_addr;
        for i in 0..per_page as u16 + 1 {
            append_map_entry(&mut media, &h, &mut f, PageAddr::new(2, i), 1).unwrap();
        }
        assert_ne!(f.map_addr, first_map);
        assert_eq!(f.map_header.prev, first_map);
        assert!(!f.map_header.next.is_valid());

        // The old page now links forward
        let old = read_map_header(&mut media, first_map).unwrap();
        assert_eq!(old.next, f.map_addr);
        assert!(!fsbm::is_page_free(&mut media, &h, f.map_addr).unwrap());

        // The cursor still reaches every run from the start
        read_first_map_entry(&mut media, &mut f).unwrap();
        let mut runs = 1;
        while read_next_map_entry(&mut media, &mut f).is_ok()
            && !f.map_entry.is_erased(0xFF)
        {
            runs += 1;
        }
        assert_eq!(runs, per_page + 1);
    }

    #[test]
    fn free_slot_probe_sees_a_filling_page() {
        let (mut media, h, _, mut f) = setup();
        read_first_map_entry(&mut media, &mut f).unwrap();
        assert!(has_free_map_entry(&mut media, &f).unwrap());
        let per_page = media.layout.map_entries_per_page;
        for i in 0..per_page as u16 {
            append_map_entry(&mut media, &h, &mut f, PageAddr::new(2, i), 1).unwrap();
        }
        assert!(!has_free_map_entry(&mut media, &f).unwrap());
    }

    #[test]
    fn walk_visits_every_data_page_and_the_map_pages() {
        let (mut media, h, mut dm, mut f) = setup();
        read_first_map_entry(&mut media, &mut f).unwrap();
        append_map_entry(&mut media, &h, &mut f, PageAddr::new(2, 0), 3).unwrap();
        append_map_entry(&mut media, &h, &mut f, PageAddr::new(3, 8), 1).unwrap();

        let mut data = Vec::new();
        let mut maps = 0;
        walk_file_pages(&mut media, &h, &mut dm, &f.entry.clone(), |_, _, _, v| {
            if v.is_map {
                maps += 1;
            } else {
                data.push(v.addr);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(maps, 1);
        assert_eq!(
            data,
            vec![
                PageAddr::new(2, 0),
                PageAddr::new(2, 1),
                PageAddr::new(2, 2),
                PageAddr::new(3, 8)
            ]
        );
    }
}
