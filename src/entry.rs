//! Entry table: fixed-capacity directory of files and directories.
//!
//! Entries are appended into the first erased slot and are never rewritten
//! in place unless the new byte pattern only programs further bits.
//! Deletion is a single attribute bit flip, so a deleted entry keeps its
//! slot until the next merge. Because appends always take the first erased
//! slot, the used slots form a prefix and an erased slot terminates a scan.

use crate::addr::{self, PageAddr};
use crate::cache::{self, Media};
use crate::delta::DeltaMap;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::header::Header;

/// File may not be written.
pub const ATTR_READONLY: u8 = 0x01;
/// Hidden from normal listings.
pub const ATTR_HIDDEN: u8 = 0x02;
/// System file.
pub const ATTR_SYSTEM: u8 = 0x04;
/// Entry is a directory; its first map address names an inner entry table.
pub const ATTR_DIR: u8 = 0x10;
/// Archive bit, set on every newly created file.
pub const ATTR_ARCHIVE: u8 = 0x20;
/// Entry has been deleted and waits for the next merge.
pub const ATTR_DELETED: u8 = 0x80;

/// File size value meaning "never written".
pub(crate) const SIZE_ERASED: u32 = u32::MAX;

/// One file or directory record, attribute bits in normalized polarity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub name: String,
    pub attrib: u8,
    pub user_data: Vec<u8>,
    pub first_map: PageAddr,
    pub size: u32,
}

impl Entry {
    pub fn new(name: &str, attrib: u8, first_map: PageAddr, user_data_bytes: usize) -> Entry {
        Entry {
            name: name.to_string(),
            attrib,
            user_data: vec![0xFF; user_data_bytes],
            first_map,
            size: SIZE_ERASED,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.attrib & ATTR_DELETED != 0
    }

    pub fn is_dir(&self) -> bool {
        self.attrib & ATTR_DIR != 0
    }

    /// Size with the erased sentinel collapsed to zero.
    pub fn logical_size(&self) -> u32 {
        if self.size == SIZE_ERASED { 0 } else { self.size }
    }

    /// Serialize for the entry table.
    ///
    /// The name is padded with the programmed byte value; attribute bits
    /// are stored inverted under all-ones erased polarity so unset bits
    /// match erased media and a later deletion is a single 1→0 flip.
    pub fn encode(&self, layout: &crate::config::Layout) -> Vec<u8> {
        let mut buf = vec![layout.erased_byte(); layout.entry_bytes];
        let name_len = layout.cfg.filename_len_max;
        buf[..name_len].fill(layout.programmed_byte());
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[name_len] = if layout.erased_byte() == 0xFF {
            self.attrib ^ 0xFF
        } else {
            self.attrib
        };
        let ud = name_len + 1;
        buf[ud..ud + self.user_data.len()].copy_from_slice(&self.user_data);
        let map_off = ud + layout.cfg.user_data_bytes;
        addr::put_addr(&mut buf, map_off, self.first_map);
        addr::put_u32(&mut buf, map_off + 4, self.size);
        buf
    }

    pub fn decode(buf: &[u8], layout: &crate::config::Layout) -> Entry {
        let name_len = layout.cfg.filename_len_max;
        // Names never contain the erased or the programmed byte value
        let erased = layout.erased_byte();
        let end = buf[..name_len]
            .iter()
            .position(|&b| b == erased || b == !erased)
            .unwrap_or(name_len);
        let name = String::from_utf8_lossy(&buf[..end]).into_owned();
        let stored = buf[name_len];
        let attrib = if layout.erased_byte() == 0xFF {
            stored ^ 0xFF
        } else {
            stored
        };
        let ud = name_len + 1;
        let map_off = ud + layout.cfg.user_data_bytes;
        Entry {
            name,
            attrib,
            user_data: buf[ud..map_off].to_vec(),
            first_map: addr::get_addr(buf, map_off),
            size: addr::get_u32(buf, map_off + 4),
        }
    }
}

/// Position of an entry slot inside a list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub page: PageAddr,
    pub offset: usize,
}

fn read_slot_bytes<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    slot: Slot,
    buf: &mut [u8],
) -> Result<()> {
    if media.layout.cfg.delta_for_entries {
        dm.read(media, header, slot.page, slot.offset, buf)
    } else {
        media.read(slot.page, slot.offset, buf)
    }
}

fn write_slot_bytes<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    slot: Slot,
    buf: &[u8],
) -> Result<()> {
    if media.layout.cfg.delta_for_entries {
        dm.write(media, header, slot.page, slot.offset, buf)?;
        Ok(())
    } else {
        media.write(slot.page, slot.offset, buf)
    }
}

/// Iterate every slot of a list, stopping when `visit` returns `Some`.
fn scan_slots<D, T>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    mut visit: impl FnMut(&mut Media<D>, &[u8], Slot) -> Result<Option<T>>,
) -> Result<Option<T>>
where
    D: FlashDevice,
{
    let entry_bytes = media.layout.entry_bytes;
    let entries_per_page = media.layout.entries_per_page;
    let pages = media.layout.entry_list_pages;
    let mut buf = vec![0u8; entry_bytes];
    let mut page = list;
    for j in 0..pages {
        for i in 0..entries_per_page {
            let slot = Slot {
                page,
                offset: i * entry_bytes,
            };
            read_slot_bytes(media, header, dm, slot, &mut buf)?;
            if let Some(t) = visit(media, &buf, slot)? {
                return Ok(Some(t));
            }
        }
        if j + 1 < pages {
            page = page.next(&media.layout.geo)?;
        }
    }
    Ok(None)
}

/// Append a record into the first erased slot of the list.
pub(crate) fn append_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    entry: &Entry,
) -> Result<()> {
    let erased = media.layout.erased_byte();
    let encoded = entry.encode(&media.layout);
    let slot = scan_slots(media, header, dm, list, |_, bytes, slot| {
        Ok(cache::is_buffer_erased(bytes, erased).then_some(slot))
    })?;
    match slot {
        Some(slot) => {
            write_slot_bytes(media, header, dm, slot, &encoded)?;
            log::debug!("entry '{}' appended at {}", entry.name, slot.page);
            Ok(())
        }
        None => Err(Error::NoMoreEntry),
    }
}

/// Find a live entry by name.
pub(crate) fn find_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    name: &str,
) -> Result<Entry> {
    find_slot(media, header, dm, list, name).map(|(e, _)| e)
}

pub(crate) fn find_slot<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    name: &str,
) -> Result<(Entry, Slot)> {
    let erased = media.layout.erased_byte();
    let layout = media.layout.clone();
    let found = scan_slots(media, header, dm, list, |_, bytes, slot| {
        if cache::is_buffer_erased(bytes, erased) {
            // Appends fill the first erased slot, nothing lives past one
            return Err(Error::FileNotFound);
        }
        let entry = Entry::decode(bytes, &layout);
        Ok((entry.name == name && !entry.is_deleted()).then_some((entry, slot)))
    });
    match found {
        Ok(Some(hit)) => Ok(hit),
        Ok(None) => Err(Error::FileNotFound),
        Err(e) => Err(e),
    }
}

/// Update a live entry in place when the new bytes are programmable over
/// the old ones; otherwise mark the old record deleted and append a fresh
/// one. `NoMoreEntry` from the append means the caller has to merge.
pub(crate) fn update_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    name: &str,
    entry: &Entry,
) -> Result<()> {
    let erased = media.layout.erased_byte();
    let (old, slot) = find_slot(media, header, dm, list, name)?;
    let old_bytes = old.encode(&media.layout);
    let new_bytes = entry.encode(&media.layout);
    if media.layout.cfg.delta_for_entries
        || cache::is_buffer_programmable(&old_bytes, &new_bytes, erased)
    {
        write_slot_bytes(media, header, dm, slot, &new_bytes)
    } else {
        log::debug!("entry '{name}' is not updatable in place");
        // Append before retiring the old record: a power loss in between
        // leaves a duplicate to clean up, never a missing file
        append_entry(media, header, dm, list, entry)?;
        supersede_slot(media, header, dm, slot, &old)
    }
}

/// Retire a record whose map chain lives on under another record (rename,
/// non-programmable update): mark it deleted *and* blank the name, so the
/// consistency check knows its pages are owned elsewhere and stay used.
/// Blanking programs every name byte, which is always a legal transition.
pub(crate) fn supersede_slot<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    slot: Slot,
    old: &Entry,
) -> Result<()> {
    let mut dead = old.clone();
    dead.attrib |= ATTR_DELETED;
    dead.name.clear();
    write_slot_bytes(media, header, dm, slot, &dead.encode(&media.layout))
}

/// Mark a live entry deleted by flipping its attribute bit.
pub(crate) fn delete_entry<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    name: &str,
) -> Result<()> {
    let (mut entry, slot) = find_slot(media, header, dm, list, name)?;
    entry.attrib |= ATTR_DELETED;
    write_slot_bytes(media, header, dm, slot, &entry.encode(&media.layout))
}

/// Count erased and fully-programmed (reclaimable) slots.
pub(crate) fn count_entries<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
) -> Result<(usize, usize)> {
    let erased = media.layout.erased_byte();
    let mut free = 0usize;
    let mut tbr = 0usize;
    scan_slots(media, header, dm, list, |_, bytes, _| {
        if cache::is_buffer_erased(bytes, erased) {
            free += 1;
        } else if cache::is_buffer_programmed(bytes, erased) {
            tbr += 1;
        }
        Ok(None::<()>)
    })?;
    Ok((free, tbr))
}

/// Read the slot at a flat index; `Ok(None)` when the slot is erased or
/// past the end of the list. Used by the directory walker.
pub(crate) fn read_indexed<D: FlashDevice>(
    media: &mut Media<D>,
    header: &Header,
    dm: &mut DeltaMap,
    list: PageAddr,
    index: usize,
) -> Result<Option<Entry>> {
    let entries_per_page = media.layout.entries_per_page;
    let pages = media.layout.entry_list_pages;
    if index >= entries_per_page * pages {
        return Err(Error::NoMoreEntry);
    }
    let page = list.add(&media.layout.geo, index / entries_per_page)?;
    let slot = Slot {
        page,
        offset: index % entries_per_page * media.layout.entry_bytes,
    };
    let mut buf = vec![0u8; media.layout.entry_bytes];
    read_slot_bytes(media, header, dm, slot, &mut buf)?;
    let erased = media.layout.erased_byte();
    if cache::is_buffer_erased(&buf, erased) {
        return Ok(None);
    }
    let layout = media.layout.clone();
    Ok(Some(Entry::decode(&buf, &layout)))
}
