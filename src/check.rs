//! Offline consistency check.
//!
//! Rebuilds the allocation state by walking every entry's map chain plus
//! the management regions, then compares the result against the stored
//! free space bitmap. Nothing is repaired; the check reports and the user
//! decides.

use crate::addr::PageAddr;
use crate::device::FlashDevice;
use crate::entry::{self, Entry};
use crate::error::{Error, Result};
use crate::fs::Fs;
use crate::fsbm;
use crate::map;

struct CheckState {
    marked: Vec<bool>,
    errors: u32,
}

impl CheckState {
    fn mark(&mut self, index: usize) {
        if index >= self.marked.len() {
            self.errors += 1;
            log::error!("page index {index} out of range");
            return;
        }
        if self.marked[index] {
            self.errors += 1;
            log::error!("page {index} referenced twice");
        }
        self.marked[index] = true;
    }
}

impl<D: FlashDevice> Fs<D> {
    /// Verify the file system's allocation invariants.
    ///
    /// For every page of every entry (deleted ones included): live pages
    /// must be marked used, a deleted entry's pages to-be-released, delta
    /// originals to-be-released with the delta page used. Finally the
    /// bitmap rebuilt from the walk must match the stored one, free pages
    /// must read erased and to-be-released pages must not.
    pub fn check(&mut self) -> Result<()> {
        let r = self.check_inner();
        self.record(r)
    }

    fn check_inner(&mut self) -> Result<()> {
        let layout = self.media.layout.clone();
        let geo = layout.geo;
        let ppb = geo.pages_per_block as usize;
        let mut st = CheckState {
            marked: vec![false; geo.fs_pages()],
            errors: 0,
        };
        let page_index = |addr: PageAddr| {
            (addr.block - geo.reserved_blocks) as usize * ppb + addr.page as usize
        };

        // Every entry of the root and of each directory, deleted included
        let capacity = layout.entries_per_page * layout.entry_list_pages;
        let root = self.header.entry_list;
        for index in 0..capacity {
            let Some(e) = entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                root,
                index,
            )?
            else {
                break;
            };
            if e.name.is_empty() {
                // Superseded record, its chain lives on under another name
                continue;
            }
            if e.is_dir() {
                self.check_dir(&e, &mut st, page_index)?;
            } else {
                self.check_file(&e, &mut st, page_index)?;
            }
        }

        // Management regions of the current area
        let mark_region = |start: PageAddr, pages: usize, st: &mut CheckState| {
            for i in 0..pages {
                st.mark(page_index(start) + i);
            }
        };
        mark_region(self.header.address(), layout.header_pages, &mut st);
        mark_region(self.header.entry_list, layout.entry_list_pages, &mut st);
        mark_region(self.header.fsbm, layout.fsbm_pages, &mut st);
        mark_region(self.header.delta_map, layout.cfg.delta_map_pages, &mut st);
        mark_region(self.header.wear_list, layout.wear_list_pages, &mut st);

        // Compare against the stored bitmap. Unreferenced pages are legal
        // only when free or awaiting release (a page can be superseded by
        // several delta generations; the intermediate ones are
        // to-be-released and owned by nobody).
        for block in geo.reserved_blocks..geo.blocks {
            for page in 0..geo.pages_per_block {
                let addr = PageAddr::new(block, page);
                let walked_used = st.marked[page_index(addr)];
                let free = fsbm::is_page_free(&mut self.media, &self.header, addr)?;
                let tbr = fsbm::is_page_to_be_released(&mut self.media, &self.header, addr)?;
                if walked_used && free {
                    st.errors += 1;
                    log::error!("page {addr} is referenced but marked free");
                    continue;
                }
                if !walked_used && !free && !tbr {
                    st.errors += 1;
                    log::error!("page {addr} is allocated but owned by nothing");
                    continue;
                }
                if free && !self.media.is_page_erased(addr)? {
                    st.errors += 1;
                    log::error!("page {addr} is marked free but not erased");
                }
                if tbr && self.media.is_page_erased(addr)? {
                    st.errors += 1;
                    log::error!("page {addr} is marked to be released but erased");
                }
            }
        }

        if st.errors > 0 {
            log::error!("consistency check found {} error(s)", st.errors);
            return Err(Error::General);
        }
        log::info!("consistency check passed");
        Ok(())
    }

    fn check_dir(
        &mut self,
        dir: &Entry,
        st: &mut CheckState,
        page_index: impl Fn(PageAddr) -> usize + Copy,
    ) -> Result<()> {
        let layout = self.media.layout.clone();
        let deleted = dir.is_deleted();
        for i in 0..layout.entry_list_pages {
            let addr = dir.first_map.add(&layout.geo, i)?;
            st.mark(page_index(addr));
            self.expect_page_state(addr, deleted, st)?;
        }
        if deleted {
            return Ok(());
        }
        let capacity = layout.entries_per_page * layout.entry_list_pages;
        for index in 0..capacity {
            let Some(e) = entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                dir.first_map,
                index,
            )?
            else {
                break;
            };
            if e.name.is_empty() || e.is_dir() {
                continue;
            }
            self.check_file(&e, st, page_index)?;
        }
        Ok(())
    }

    fn check_file(
        &mut self,
        e: &Entry,
        st: &mut CheckState,
        page_index: impl Fn(PageAddr) -> usize + Copy,
    ) -> Result<()> {
        log::debug!("checking '{}'", e.name);
        let deleted = e.is_deleted();
        let mut visits = Vec::new();
        map::walk_file_pages(
            &mut self.media,
            &self.header,
            &mut self.delta,
            e,
            |_, _, _, v| {
                visits.push(v);
                Ok(())
            },
        )?;
        for v in visits {
            if v.is_map {
                st.mark(page_index(v.addr));
                self.expect_page_state(v.addr, deleted, st)?;
            } else if v.delta != v.addr {
                // Delta in effect: the original must await release, the
                // delta page carries the live content
                st.mark(page_index(v.addr));
                st.mark(page_index(v.delta));
                if fsbm::is_page_free(&mut self.media, &self.header, v.addr)? {
                    st.errors += 1;
                    log::error!("'{}': original page {} is marked free", e.name, v.addr);
                }
                if !fsbm::is_page_to_be_released(&mut self.media, &self.header, v.addr)? {
                    st.errors += 1;
                    log::error!(
                        "'{}': original page {} is not marked to be released",
                        e.name,
                        v.addr
                    );
                }
                self.expect_page_state(v.delta, deleted, st)?;
            } else {
                st.mark(page_index(v.addr));
                self.expect_page_state(v.addr, deleted, st)?;
            }
        }
        Ok(())
    }

    /// A page owned by a live entry must be used; owned by a deleted entry
    /// it must be awaiting release.
    fn expect_page_state(
        &mut self,
        addr: PageAddr,
        deleted: bool,
        st: &mut CheckState,
    ) -> Result<()> {
        if fsbm::is_page_free(&mut self.media, &self.header, addr)? {
            st.errors += 1;
            log::error!("page {addr} is marked free but referenced");
            return Ok(());
        }
        let tbr = fsbm::is_page_to_be_released(&mut self.media, &self.header, addr)?;
        if tbr != deleted {
            st.errors += 1;
            log::error!(
                "page {addr} {} marked to be released",
                if tbr { "is wrongly" } else { "should be" }
            );
        }
        Ok(())
    }
}
