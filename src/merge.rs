//! Management-area merge: generational compaction.
//!
//! When the primary management area runs out of free pages, map slots,
//! entry slots or delta entries, the live set is copied into the secondary
//! area and the reclaimable blocks are erased. The copy is ordered so that
//! a power loss at any program or erase boundary leaves either the old or
//! the new area authoritative, never a torn mix:
//!
//! 1. close open files, remembering how to restore them
//! 2. erase the secondary blocks
//! 3. prepare the new header, counter bumped, checksum still erased
//! 4. copy the free space bitmap, erasing fully reclaimable data blocks
//!    and freeing both old management areas in the new bitmap
//! 5. write the new header uncommitted, reserving its own regions
//! 6. carry the wear list over with the tick bits folded
//! 7. copy live entries, rebuilding each map chain with deltas collapsed
//! 8. program the checksum: the single-page commit point
//! 9. erase the old management area, drop the delta mirror
//! 10. pick and program the next management area
//! 11. reopen the files and restore their positions
//!
//! Interrupted before 8: the old header stays authoritative and nothing
//! the copy wrote is reachable. Interrupted after 8: mount finds the new
//! header, erases whatever the tail left behind and completes step 10.

use crate::addr::{FIELD_ERASED, PageAddr};
use crate::device::FlashDevice;
use crate::entry::{self, Entry};
use crate::error::{Error, Result};
use crate::file::{Mode, SeekFrom, Slot};
use crate::fs::Fs;
use crate::fsbm;
use crate::header::{self, BlockType, Header};
use crate::map;
use crate::wear;

/// How [`copy_fsbm`] treats one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposition {
    /// Live data, bitmap bits copied unchanged.
    Copy,
    /// Every page is to-be-released: erase and record as free.
    Erase,
    /// Old primary or secondary management: record as free.
    Free,
}

impl<D: FlashDevice> Fs<D> {
    /// Compact if the upcoming operation could run the management area or
    /// the delta index dry.
    ///
    /// `file_idx` names the open file about to grow, so a still-free map
    /// slot in its current map page can avoid a needless merge.
    pub(crate) fn merge_check(
        &mut self,
        file_idx: Option<usize>,
        data_pages_needed: usize,
        delta_slots_needed: usize,
    ) -> Result<()> {
        if self.merging {
            return Ok(());
        }
        let mut merge = self.wear_fold_pending;
        if !merge && delta_slots_needed > 0 {
            let free = self.delta.free_slots(&mut self.media, &self.header)?;
            if free < delta_slots_needed {
                log::debug!("delta index low ({free} < {delta_slots_needed})");
                merge = true;
            }
        }
        if !merge {
            let (free_mgmt, free_data) = fsbm::count_pages(&mut self.media, &self.header, true)?;
            if free_data < data_pages_needed || free_mgmt == 0 {
                let (tbr_mgmt, tbr_data) =
                    fsbm::count_pages(&mut self.media, &self.header, false)?;
                if free_data < data_pages_needed && tbr_data > 0 {
                    merge = true;
                }
                if free_mgmt == 0 && tbr_mgmt > 0 {
                    merge = match file_idx {
                        Some(i) if self.files[i].map_addr.is_valid() => {
                            !map::has_free_map_entry(&mut self.media, &self.files[i])?
                        }
                        _ => true,
                    };
                }
            }
        }
        if merge {
            self.merge()?;
        }
        Ok(())
    }

    /// Move the live set from the primary into the secondary management
    /// area and reclaim every fully released block.
    pub fn merge(&mut self) -> Result<()> {
        if self.merging {
            log::error!("merge requested while merging");
            return Err(Error::General);
        }
        self.merging = true;
        let r = self.merge_inner();
        self.merging = false;
        self.record(r)
    }

    fn merge_inner(&mut self) -> Result<()> {
        log::info!("merging, counter {} -> {}", self.header.counter, self.header.counter + 1);
        let layout = self.media.layout.clone();
        let geo = layout.geo;
        let mgmt = layout.cfg.mgmt_blocks;

        if self.header.next_management_block == FIELD_ERASED {
            self.assign_next_mgmt_area()?;
        }
        // The old delta mappings must sit in RAM before the header moves.
        self.delta.ensure_loaded(&mut self.media, &self.header)?;

        // 1. close open files. A pending entry update can need a fresh
        // slot the full table cannot give; it is deferred until the copy
        // has compacted the table, the data pages are all on media anyway.
        let mut saved: Vec<Option<(Option<String>, String, Mode, u32)>> =
            vec![None; self.files.len()];
        let mut deferred: Vec<(usize, Entry)> = Vec::new();
        for i in 0..self.files.len() {
            if self.files[i].open {
                let f = &self.files[i];
                saved[i] = Some((f.dir_name.clone(), f.entry.name.clone(), f.mode, f.read_pos));
                let pending = f.entry.clone();
                match self.with_file(Slot::Public(i), |fs, f| fs.close_file(f)) {
                    Ok(()) => {}
                    Err(Error::NoMoreEntry) => deferred.push((i, pending)),
                    Err(e) => return Err(e),
                }
            }
        }

        // 2. erase the secondary area; its wear list does not exist yet,
        // so the erases are carried as pending counts
        let mut pending = vec![0u16; geo.fs_blocks() as usize];
        let new_block = self.header.next_management_block;
        for b in new_block..new_block + mgmt {
            self.media.erase_block(b)?;
            pending[(b - geo.reserved_blocks) as usize] += 1;
        }

        // 3. prepare the new header
        let new_header = Header::init(&layout, new_block, self.header.counter + 1, FIELD_ERASED)?;

        // 4. copy the free space bitmap
        self.copy_fsbm(&new_header, &mut pending)?;

        // 5. write it uncommitted; marking reserves its own regions in the
        // new bitmap, which allocations below will use
        header::write_header(&mut self.media, &new_header, false, true)?;
        let old_header = core::mem::replace(&mut self.header, new_header);

        // 6. carry the wear list over, ticks folded
        wear::copy_list(&mut self.media, &old_header, &self.header, &pending)?;
        self.wear_fold_pending = false;
        let mut h = self.header.clone();
        wear::generate_least_weared(&mut self.media, &mut h)?;
        self.header = h;

        // 7. copy live entries, collapsing deltas
        self.copy_entries(&old_header)?;

        // 8. commit: every field of the header page is already programmed,
        // the checksum is the only erased word left
        let mut h = self.header.clone();
        header::write_header(&mut self.media, &h, true, false)?;
        self.media.flush()?;
        h.committed = true;
        self.header = h;

        // 9. erase the old area, forget the collapsed deltas
        for b in old_header.management_block..old_header.management_block + mgmt {
            self.erase_block_counted(b)?;
        }
        self.delta.invalidate(layout.erased_byte());

        // 10. choose the next secondary area
        self.assign_next_mgmt_area()?;

        // 11. reopen files where they were, landing any deferred entry
        // update in the compacted table first
        for (i, s) in saved.into_iter().enumerate() {
            let Some((dir_name, name, mode, pos)) = s else {
                continue;
            };
            let list = self.list_for_dir(&dir_name)?;
            if let Some(p) = deferred.iter().position(|(slot, _)| *slot == i) {
                let (_, pending) = deferred.swap_remove(p);
                entry::update_entry(
                    &mut self.media,
                    &self.header,
                    &mut self.delta,
                    list,
                    &name,
                    &pending,
                )?;
            }
            let mut reopen = mode;
            reopen.truncate = false;
            reopen.must_exist = true;
            self.files[i].in_use = true;
            self.with_file(Slot::Public(i), |fs, f| {
                fs.open_file(f, list, dir_name, &name, Some(reopen), false)?;
                fs.seek_file(f, SeekFrom::Start(pos))?;
                Ok(())
            })?;
        }
        // Open directory listings move to the new area as well
        for i in 0..self.dirs.len() {
            if self.dirs[i].in_use {
                let dir_name = self.dirs[i].dir_name.clone();
                self.dirs[i].list = self.list_for_dir(&dir_name)?;
            }
        }
        log::info!("merge complete, management at block {}", self.header.management_block);
        self.media.flush()
    }

    /// Copy the free space bitmap into the new area. Fully released data
    /// blocks are erased and recorded free; both management areas are
    /// recorded free (the new one re-reserves itself when its header is
    /// written, the old one is erased after the commit).
    fn copy_fsbm(&mut self, new_header: &Header, pending: &mut [u16]) -> Result<()> {
        let layout = self.media.layout.clone();
        let geo = layout.geo;
        let old_header = self.header.clone();
        let mgmt = layout.cfg.mgmt_blocks;
        let erased = layout.erased_byte();

        let mut disposition = Vec::with_capacity(geo.fs_blocks() as usize);
        for block in geo.reserved_blocks..geo.blocks {
            let is_old_mgmt = block >= old_header.management_block
                && block < old_header.management_block + mgmt;
            let is_new_mgmt =
                block >= new_header.management_block && block < new_header.management_block + mgmt;
            let d = if is_old_mgmt || is_new_mgmt {
                Disposition::Free
            } else if fsbm::is_block_fully_tbr(&mut self.media, &old_header, block)? {
                Disposition::Erase
            } else {
                Disposition::Copy
            };
            disposition.push(d);
        }

        for (i, d) in disposition.iter().enumerate() {
            if *d == Disposition::Erase {
                let block = geo.reserved_blocks + i as u16;
                log::debug!("block {block} fully released, erasing");
                self.media.erase_block(block)?;
                pending[i] += 1;
            }
        }

        // Rewrite the bitmap page by page with freed blocks reset
        let page_bytes = geo.page_bytes;
        let mut remaining = layout.fsbm_bytes;
        let mut buf = vec![0u8; page_bytes];
        for k in 0..layout.fsbm_pages {
            let old_page = old_header.fsbm.add(&geo, k)?;
            self.media.read(old_page, 0, &mut buf)?;
            let first_bit = k * page_bytes * 8;
            let covered = remaining.min(page_bytes) * 4;
            for local in 0..covered {
                let page_index = first_bit / 2 + local;
                let block_index = page_index / geo.pages_per_block as usize;
                if block_index >= disposition.len() {
                    break;
                }
                if disposition[block_index] != Disposition::Copy {
                    let byte = local / 4;
                    let mask = 0b11 << (local % 4 * 2);
                    if erased == 0xFF {
                        buf[byte] |= mask;
                    } else {
                        buf[byte] &= !mask;
                    }
                }
            }
            remaining = remaining.saturating_sub(page_bytes);
            let new_page = new_header.fsbm.add(&geo, k)?;
            self.media.write(new_page, 0, &buf)?;
        }
        self.media.flush()
    }

    /// Copy every live entry of the old area: files get their map chains
    /// rebuilt with deltas collapsed, directories get a fresh inner entry
    /// table and their files copied one level deep.
    fn copy_entries(&mut self, old_header: &Header) -> Result<()> {
        let capacity = self.media.layout.entries_per_page * self.media.layout.entry_list_pages;
        for index in 0..capacity {
            let slot = entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                old_header.entry_list,
                index,
            )?;
            let Some(e) = slot else {
                break;
            };
            if e.is_deleted() {
                continue;
            }
            if e.is_dir() {
                self.copy_dir(old_header, &e)?;
            } else {
                let root = self.header.entry_list;
                self.copy_file_map(&e, root, None)?;
            }
        }
        Ok(())
    }

    fn copy_dir(&mut self, old_header: &Header, dir: &Entry) -> Result<()> {
        log::debug!("copying directory '{}'", dir.name);
        let pages = self.media.layout.entry_list_pages;
        let (new_list, found) = wear::find_free_pages_wl(
            &mut self.media,
            &self.header,
            pages,
            pages,
            BlockType::PrimaryMgmt,
        )?;
        if found < pages {
            return Err(Error::NoMoreSpace);
        }
        let mut copied = dir.clone();
        copied.first_map = new_list;
        let root = self.header.entry_list;
        entry::append_entry(&mut self.media, &self.header, &mut self.delta, root, &copied)?;
        fsbm::mark_pages(&mut self.media, &self.header, new_list, pages, fsbm::Mark::Used)?;

        let capacity = self.media.layout.entries_per_page * pages;
        for index in 0..capacity {
            let slot = entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                dir.first_map,
                index,
            )?;
            let Some(e) = slot else {
                break;
            };
            if e.is_deleted() || e.is_dir() {
                continue;
            }
            self.copy_file_map(&e, new_list, Some(dir.name.clone()))?;
        }
        Ok(())
    }

    /// Recreate one file in the new area and append one map entry per live
    /// page, resolved through the old delta mappings still mirrored in RAM.
    fn copy_file_map(
        &mut self,
        old_entry: &Entry,
        target_list: PageAddr,
        dir_name: Option<String>,
    ) -> Result<()> {
        log::debug!("copying map of '{}'", old_entry.name);
        // A power loss between the append and retire halves of an entry
        // update can leave two records with one name; the first one copied
        // wins and the straggler is dropped here
        let probe = entry::find_entry(
            &mut self.media,
            &self.header,
            &mut self.delta,
            target_list,
            &old_entry.name,
        );
        match probe {
            Ok(_) => {
                log::warn!("duplicate entry '{}' dropped by merge", old_entry.name);
                return Ok(());
            }
            Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }
        let old = old_entry.clone();
        self.with_file(Slot::Internal, |fs, f| {
            fs.open_file(f, target_list, dir_name, &old.name, Some(Mode::WRITE), false)?;
            map::walk_file_pages(
                &mut fs.media,
                &fs.header,
                &mut fs.delta,
                &old,
                |media, header, _, visit| {
                    if visit.is_map {
                        return Ok(());
                    }
                    map::append_map_entry(media, header, f, visit.delta, 1)
                },
            )?;
            // Fresh entries carry defaults; restore the real metadata so
            // the close below programs it in place
            f.entry.attrib = old.attrib;
            f.entry.user_data = old.user_data.clone();
            f.entry.size = old.size;
            f.size_changed = true;
            fs.close_file(f)
        })
    }
}
