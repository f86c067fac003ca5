use core::fmt;

use crate::addr::{FIELD_ERASED, PageAddr};
use crate::cache::Media;
use crate::config::{Config, Layout};
use crate::delta::DeltaMap;
use crate::device::FlashDevice;
use crate::dir::OpenDir;
use crate::entry;
use crate::error::{Error, Result};
use crate::file::OpenFile;
use crate::fsbm;
use crate::header::{self, BlockType, Header};
use crate::wear;

/// Free or reclaimable space broken down by area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    pub management_pages: usize,
    pub data_pages: usize,
    pub management_bytes: usize,
    pub data_bytes: usize,
}

/// A mounted file system over a flash device.
///
/// All state lives in this value: the authoritative header, the logical
/// page cache, the bounded open-file and open-dir tables, the delta index
/// mirror and the current working directory. Every operation takes
/// `&mut self`; callers that share the mount across tasks wrap it in a
/// mutex.
pub struct Fs<D: FlashDevice> {
    pub(crate) media: Media<D>,
    pub(crate) header: Header,
    pub(crate) delta: DeltaMap,
    pub(crate) files: Vec<OpenFile>,
    /// Slot for internally opened files (remove, copy, wear leveling).
    pub(crate) internal: OpenFile,
    pub(crate) dirs: Vec<OpenDir>,
    pub(crate) cwd: String,
    pub(crate) last_error: Option<Error>,
    pub(crate) merging: bool,
    /// Set when a wear entry ran out of tick bits; folded at next merge.
    pub(crate) wear_fold_pending: bool,
}

impl<D: FlashDevice> Fs<D> {
    /// Mount the file system, formatting the device when no committed
    /// header exists.
    ///
    /// Mount scans every block's first logical page for header candidates,
    /// picks the committed one with the largest counter, erases the loser
    /// of an interrupted merge and completes a merge tail that lost power
    /// after its commit point.
    pub fn mount(mut dev: D, config: Config) -> Result<Fs<D>> {
        let layout = Layout::new(&dev, &config)?;
        dev.init().map_err(|_| Error::FlashInit)?;
        let mut media = Media::new(dev, layout.clone());

        let header_len = header::header_bytes(config.least_weared_blocks);
        let mut best: Option<Header> = None;
        let mut stale: Vec<u16> = Vec::new();
        let mut buf = vec![0u8; header_len];
        for block in layout.geo.reserved_blocks..layout.geo.blocks {
            media.read(PageAddr::new(block, 0), 0, &mut buf)?;
            let Some(candidate) = Header::decode(&buf, &layout)? else {
                continue;
            };
            if !candidate.committed {
                log::warn!("uncommitted header at block {block} ignored");
                continue;
            }
            log::debug!(
                "header candidate at block {block}, counter {}",
                candidate.counter
            );
            match &best {
                Some(b) if b.counter >= candidate.counter => stale.push(block),
                Some(b) => {
                    stale.push(b.management_block);
                    best = Some(candidate);
                }
                None => best = Some(candidate),
            }
        }

        let mut fs = match best {
            Some(header) => {
                let delta = DeltaMap::new(
                    config.delta_map_pages,
                    layout.geo.page_bytes,
                    layout.erased_byte(),
                );
                let mut fs = Fs::with_state(media, header, delta, &config);
                fs.recover(&stale)?;
                fs
            }
            None => {
                log::warn!("no file system header found, formatting");
                Fs::format(media, &config)?
            }
        };
        fs.media.flush()?;
        log::info!(
            "mounted, header counter {}, management block {}",
            fs.header.counter,
            fs.header.management_block
        );
        Ok(fs)
    }

    fn with_state(media: Media<D>, header: Header, delta: DeltaMap, config: &Config) -> Fs<D> {
        let sep = config.path_separator;
        Fs {
            media,
            header,
            delta,
            files: (0..config.max_open_files).map(|_| OpenFile::new()).collect(),
            internal: OpenFile::new(),
            dirs: (0..config.max_open_dirs).map(|_| OpenDir::new()).collect(),
            cwd: sep.to_string(),
            last_error: None,
            merging: false,
            wear_fold_pending: false,
        }
    }

    /// Create a brand-new file system: erase everything, lay the first
    /// management area into the lowest usable blocks.
    fn format(mut media: Media<D>, config: &Config) -> Result<Fs<D>> {
        let layout = media.layout.clone();
        for block in layout.geo.reserved_blocks..layout.geo.blocks {
            media.erase_block(block)?;
        }
        let first = layout.geo.reserved_blocks;
        let header = Header::init(&layout, first, 0, first + config.mgmt_blocks)?;
        header::write_header(&mut media, &header, true, true)?;
        wear::init_list(&mut media, &header)?;
        media.flush()?;
        let delta = DeltaMap::new(
            config.delta_map_pages,
            layout.geo.page_bytes,
            layout.erased_byte(),
        );
        Ok(Fs::with_state(media, header, delta, config))
    }

    /// Finish whatever an interrupted merge left behind.
    fn recover(&mut self, stale_headers: &[u16]) -> Result<()> {
        // A second committed header is the loser of a merge that was
        // interrupted after the new area took over: erase its area.
        for &block in stale_headers {
            log::warn!("erasing superseded management area at block {block}");
            for b in block..block + self.media.layout.cfg.mgmt_blocks {
                self.erase_block_counted(b)?;
            }
        }
        if self.header.next_management_block == FIELD_ERASED {
            // Power was lost between the commit and the tail of a merge.
            log::warn!("merge tail incomplete, finishing");
            self.erase_stale_free_blocks()?;
            self.assign_next_mgmt_area()?;
        }
        Ok(())
    }

    /// Erase any block whose every page is marked free but which is not
    /// physically erased. Only an interrupted merge tail leaves blocks in
    /// this state.
    fn erase_stale_free_blocks(&mut self) -> Result<()> {
        let geo = self.media.layout.geo;
        'blocks: for block in geo.reserved_blocks..geo.blocks {
            if self.header.block_type(&self.media.layout, block) != BlockType::Data {
                continue;
            }
            for page in 0..geo.pages_per_block {
                let addr = PageAddr::new(block, page);
                if !fsbm::is_page_free(&mut self.media, &self.header, addr)? {
                    continue 'blocks;
                }
            }
            let mut erased = true;
            for page in 0..geo.pages_per_block {
                if !self.media.is_page_erased(PageAddr::new(block, page))? {
                    erased = false;
                    break;
                }
            }
            if !erased {
                log::warn!("block {block} is free-marked but programmed, erasing");
                self.erase_block_counted(block)?;
            }
        }
        Ok(())
    }

    /// Pick and commit the next (secondary) management area, preferring
    /// the blocks right after the current one.
    pub(crate) fn assign_next_mgmt_area(&mut self) -> Result<()> {
        let mgmt = self.media.layout.cfg.mgmt_blocks as usize;
        let after = self.header.management_block + self.media.layout.cfg.mgmt_blocks;
        let next = match fsbm::find_free_blocks(
            &mut self.media,
            &self.header,
            mgmt,
            BlockType::Any,
            after,
        ) {
            Ok(block) => block,
            Err(Error::NoMoreSpace) => {
                let reserved_blocks = self.media.layout.geo.reserved_blocks;
                fsbm::find_free_blocks(
                    &mut self.media,
                    &self.header,
                    mgmt,
                    BlockType::Any,
                    reserved_blocks,
                )?
            }
            Err(e) => return Err(e),
        };
        log::debug!("next management area at block {next}");
        header::commit_next_mgmt(&mut self.media, &mut self.header, next)
    }

    /// Erase a block and log the erase in the wear level list.
    pub(crate) fn erase_block_counted(&mut self, block: u16) -> Result<()> {
        self.media.erase_block(block)?;
        if !wear::increment(&mut self.media, &self.header, block)? {
            self.wear_fold_pending = true;
        }
        Ok(())
    }

    /// Flush all cached state and shut the device down.
    pub fn unmount(mut self) -> Result<D> {
        self.media.flush()?;
        self.media.dev.deinit().map_err(|_| Error::FlashGeneral)?;
        Ok(self.media.into_device())
    }

    /// Hand the device back without flushing. Meant for inspecting the
    /// media after a simulated power loss.
    pub fn into_device(self) -> D {
        self.media.into_device()
    }

    /// Last error recorded by any operation on this mount.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub(crate) fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(*e);
        }
        result
    }

    /// Free space split into management and data areas.
    pub fn free_space(&mut self) -> Result<SpaceInfo> {
        let (mgmt, data) = fsbm::count_pages(&mut self.media, &self.header, true)?;
        Ok(self.space_info(mgmt, data))
    }

    /// Space waiting to be reclaimed by the next merge.
    pub fn to_be_released_space(&mut self) -> Result<SpaceInfo> {
        let (mgmt, data) = fsbm::count_pages(&mut self.media, &self.header, false)?;
        Ok(self.space_info(mgmt, data))
    }

    fn space_info(&self, mgmt: usize, data: usize) -> SpaceInfo {
        let page = self.media.layout.geo.page_bytes;
        SpaceInfo {
            management_pages: mgmt,
            data_pages: data,
            management_bytes: mgmt * page,
            data_bytes: data * page,
        }
    }

    /// Erased and reclaimable slots of the root entry table.
    pub fn entry_stats(&mut self) -> Result<(usize, usize)> {
        let list = self.header.entry_list;
        entry::count_entries(&mut self.media, &self.header, &mut self.delta, list)
    }

    /// Effective erase counts of every file system block, reserved prefix
    /// excluded.
    pub fn wear_counts(&mut self) -> Result<Vec<u16>> {
        let geo = self.media.layout.geo;
        let mut counts = Vec::with_capacity(geo.fs_blocks() as usize);
        for block in geo.reserved_blocks..geo.blocks {
            counts.push(wear::get(&mut self.media, &self.header, block)?);
        }
        Ok(counts)
    }
}

impl<D: FlashDevice> fmt::Display for Fs<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = &self.media.layout;
        let geo = &l.geo;
        writeln!(f, "geometry: {} blocks ({} reserved), {} logical pages/block, {} B/page",
            geo.blocks, geo.reserved_blocks, geo.pages_per_block, geo.page_bytes)?;
        writeln!(
            f,
            "management: {} block(s)/area, header {}p entries {}p bitmap {}p delta {}p wear {}p",
            l.cfg.mgmt_blocks,
            l.header_pages,
            l.entry_list_pages,
            l.fsbm_pages,
            l.cfg.delta_map_pages,
            l.wear_list_pages
        )?;
        writeln!(
            f,
            "header: counter {}, primary block {}, secondary block {}",
            self.header.counter, self.header.management_block, self.header.next_management_block
        )?;
        write!(
            f,
            "capacity: {} entries, {} map entries/page, {} delta entries",
            l.cfg.max_entries,
            l.map_entries_per_page,
            l.delta_capacity()
        )
    }
}
