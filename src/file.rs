//! File handles and the read/write/seek path.

use core::str::FromStr;

use crate::addr::PageAddr;
use crate::config::MAP_RUN_MAX;
use crate::device::FlashDevice;
use crate::dir::check_filename;
use crate::entry::{self, ATTR_ARCHIVE, Entry, SIZE_ERASED};
use crate::error::{Error, Result};
use crate::fs::Fs;
use crate::fsbm;
use crate::header::BlockType;
use crate::map::{self, MapEntry, MapHeader};
use crate::wear;

/// Handle to an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId(pub(crate) usize);

/// Open mode flags.
///
/// The usual short strings parse into this: `r`, `r+`, `w`, `w+`, `a`,
/// `a+` (a `b` suffix is accepted and ignored; all I/O is binary).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mode {
    pub read: bool,
    pub write: bool,
    /// Every write goes to the end of the file.
    pub append: bool,
    /// Release the existing content on open.
    pub truncate: bool,
    /// Fail when the file does not exist.
    pub must_exist: bool,
}

impl Mode {
    /// `r`: read an existing file.
    pub const READ: Mode = Mode {
        read: true,
        must_exist: true,
        write: false,
        append: false,
        truncate: false,
    };
    /// `w`: write, creating or truncating.
    pub const WRITE: Mode = Mode {
        write: true,
        truncate: true,
        read: false,
        append: false,
        must_exist: false,
    };
    /// `a`: append, creating when absent.
    pub const APPEND: Mode = Mode {
        write: true,
        append: true,
        read: false,
        truncate: false,
        must_exist: false,
    };

    fn is_valid(&self) -> bool {
        (self.read || self.write) && !(self.truncate && self.must_exist)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Mode> {
        let mut mode = Mode::default();
        for c in s.chars() {
            match c {
                'r' => {
                    mode.read = true;
                    mode.must_exist = true;
                }
                'w' => {
                    mode.write = true;
                    mode.truncate = true;
                }
                'a' => {
                    mode.write = true;
                    mode.append = true;
                }
                '+' => {
                    if mode.truncate || mode.append {
                        mode.read = true;
                    } else if mode.read {
                        mode.write = true;
                    } else {
                        return Err(Error::InvalidOpenMode);
                    }
                }
                'b' => {}
                _ => return Err(Error::InvalidOpenMode),
            }
        }
        if !mode.is_valid() {
            return Err(Error::InvalidOpenMode);
        }
        Ok(mode)
    }
}

/// Seek target, mirroring SET / CUR / END.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i64),
    End(i64),
}

/// One slot of the bounded open-file table.
#[derive(Clone, Debug)]
pub(crate) struct OpenFile {
    pub in_use: bool,
    pub open: bool,
    pub entry: Entry,
    /// Directory holding the entry, `None` for the root.
    pub dir_name: Option<String>,
    /// Entry list holding the entry.
    pub list_addr: PageAddr,
    pub mode: Mode,
    pub error: Option<Error>,
    pub size_changed: bool,
    // Cursor over the map chain
    pub map_addr: PageAddr,
    pub map_header: MapHeader,
    pub map_idx: usize,
    pub map_entry: MapEntry,
    // Read position
    pub read_pos: u32,
    pub read_addr: PageAddr,
    pub read_run: u16,
    // Write position
    pub write_pos: u32,
    pub write_addr: PageAddr,
    pub write_run: u16,
}

impl OpenFile {
    pub fn new() -> OpenFile {
        OpenFile {
            in_use: false,
            open: false,
            entry: Entry::new("", 0, PageAddr::INVALID, 0),
            dir_name: None,
            list_addr: PageAddr::INVALID,
            mode: Mode::default(),
            error: None,
            size_changed: false,
            map_addr: PageAddr::INVALID,
            map_header: MapHeader::ERASED,
            map_idx: 0,
            map_entry: MapEntry {
                addr: PageAddr::ERASED,
                count: 0xFF,
            },
            read_pos: 0,
            read_addr: PageAddr::INVALID,
            read_run: 0,
            write_pos: 0,
            write_addr: PageAddr::INVALID,
            write_run: 0,
        }
    }

    fn reset_cursor(&mut self) {
        self.read_pos = 0;
        self.read_addr = PageAddr::INVALID;
        self.read_run = 0;
        self.write_pos = 0;
        self.write_addr = PageAddr::INVALID;
        self.write_run = 0;
        self.map_addr = PageAddr::INVALID;
        self.map_idx = 0;
        self.size_changed = false;
    }
}

impl Default for OpenFile {
    fn default() -> Self {
        OpenFile::new()
    }
}

/// Which slot of the file table an internal routine works on.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Slot {
    Public(usize),
    Internal,
}

impl<D: FlashDevice> Fs<D> {
    pub(crate) fn slot_mut(&mut self, slot: Slot) -> &mut OpenFile {
        match slot {
            Slot::Public(i) => &mut self.files[i],
            Slot::Internal => &mut self.internal,
        }
    }

    /// Run `op` on a file slot taken out of the table, so the operation
    /// can freely borrow the rest of the mount state. Errors are recorded
    /// in the slot and the mount-wide last-error.
    pub(crate) fn with_file<T>(
        &mut self,
        slot: Slot,
        op: impl FnOnce(&mut Self, &mut OpenFile) -> Result<T>,
    ) -> Result<T> {
        let mut file = core::mem::take(self.slot_mut(slot));
        let r = op(self, &mut file);
        if let Err(e) = &r {
            file.error = Some(*e);
        }
        *self.slot_mut(slot) = file;
        self.record(r)
    }

    fn public_slot(&self, id: FileId) -> Result<usize> {
        match self.files.get(id.0) {
            Some(f) if f.in_use && f.open => Ok(id.0),
            _ => Err(Error::General),
        }
    }

    /// Open a file. The mode is usually parsed from the classic short
    /// strings: `fs.open("a.dat", "w".parse()?)`.
    pub fn open(&mut self, path: &str, mode: Mode) -> Result<FileId> {
        let r = self.open_inner(path, mode);
        self.record(r)
    }

    fn open_inner(&mut self, path: &str, mode: Mode) -> Result<FileId> {
        if !mode.is_valid() {
            return Err(Error::InvalidOpenMode);
        }
        let (list, dir_name, leaf) = self.resolve_parent(path)?;
        check_filename(&leaf, self.media.layout.cfg.filename_len_max)?;
        let idx = self
            .files
            .iter()
            .position(|f| !f.in_use)
            .ok_or(Error::NoMoreResource)?;
        self.files[idx].in_use = true;
        let r = self.with_file(Slot::Public(idx), |fs, f| {
            fs.open_file(f, list, dir_name, &leaf, Some(mode), true)
        });
        match r {
            Ok(()) => Ok(FileId(idx)),
            Err(e) => {
                self.files[idx] = OpenFile::new();
                Err(e)
            }
        }
    }

    /// Shared open routine for public handles, the internal slot and the
    /// reopen after a merge.
    pub(crate) fn open_file(
        &mut self,
        f: &mut OpenFile,
        list: PageAddr,
        dir_name: Option<String>,
        name: &str,
        mode: Option<Mode>,
        merge_allowed: bool,
    ) -> Result<()> {
        f.reset_cursor();
        f.open = false;
        f.in_use = true;
        f.error = None;
        f.dir_name = dir_name;
        f.list_addr = list;
        if let Some(m) = mode {
            f.mode = m;
        }

        let mut create = false;
        match entry::find_entry(&mut self.media, &self.header, &mut self.delta, list, name) {
            Ok(e) if e.is_dir() => return Err(Error::IsADirectory),
            Ok(e) => {
                if f.mode.truncate {
                    entry::delete_entry(&mut self.media, &self.header, &mut self.delta, list, name)?;
                    map::release_file_pages(&mut self.media, &self.header, &mut self.delta, &e)?;
                    f.size_changed = true;
                    create = true;
                } else {
                    f.entry = e;
                    f.open = true;
                }
            }
            Err(Error::FileNotFound) => {
                if f.mode.must_exist {
                    return Err(Error::FileNotFound);
                }
                if !(f.mode.truncate || f.mode.append) {
                    return Err(Error::FileNotFound);
                }
                create = true;
            }
            Err(e) => return Err(e),
        }

        if create {
            let mut attempt = 0;
            loop {
                if attempt == 0 && merge_allowed && !self.merging {
                    self.merge_check(None, 1, 0)?;
                }
                match self.create_file_entry(f, name) {
                    Ok(()) => {
                        f.open = true;
                        break;
                    }
                    Err(Error::NoMoreEntry | Error::NoMoreSpace)
                        if attempt == 0 && merge_allowed && !self.merging =>
                    {
                        self.merge()?;
                        f.list_addr = self.list_for_dir(&f.dir_name)?;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.load_first_map(f)
    }

    /// Allocate a first map page and append a fresh entry for `name`.
    fn create_file_entry(&mut self, f: &mut OpenFile, name: &str) -> Result<()> {
        let (map_page, _) =
            wear::find_free_pages_wl(&mut self.media, &self.header, 1, 1, BlockType::PrimaryMgmt)?;
        let user_data = self.media.layout.cfg.user_data_bytes;
        let e = Entry::new(name, ATTR_ARCHIVE, map_page, user_data);
        entry::append_entry(
            &mut self.media,
            &self.header,
            &mut self.delta,
            f.list_addr,
            &e,
        )?;
        fsbm::mark_pages(&mut self.media, &self.header, map_page, 1, fsbm::Mark::Used)?;
        log::debug!("file '{name}' created, first map at {map_page}");
        f.entry = e;
        Ok(())
    }

    /// Entry list for a directory name, re-resolved against the current
    /// header. Needed after a merge moved the management area.
    pub(crate) fn list_for_dir(&mut self, dir_name: &Option<String>) -> Result<PageAddr> {
        match dir_name {
            None => Ok(self.header.entry_list),
            Some(name) => {
                let root = self.header.entry_list;
                let e =
                    entry::find_entry(&mut self.media, &self.header, &mut self.delta, root, name)?;
                if !e.is_dir() {
                    return Err(Error::NotADirectory);
                }
                Ok(e.first_map)
            }
        }
    }

    /// Position the read cursor on the file's first page.
    fn load_first_map(&mut self, f: &mut OpenFile) -> Result<()> {
        map::read_first_map_entry(&mut self.media, f)?;
        let erased = self.media.layout.erased_byte();
        if f.map_entry.is_erased(erased) {
            f.read_addr = PageAddr::INVALID;
            f.read_run = 0;
        } else {
            f.read_addr = f.map_entry.addr;
            f.read_run = f.map_entry.count as u16;
        }
        f.write_addr = f.read_addr;
        f.write_run = f.read_run;
        Ok(())
    }

    fn inc_read_addr(&mut self, f: &mut OpenFile) -> Result<()> {
        if f.read_run > 1 {
            f.read_run -= 1;
            f.read_addr = f.read_addr.next(&self.media.layout.geo)?;
            return Ok(());
        }
        map::read_next_map_entry(&mut self.media, f)?;
        let erased = self.media.layout.erased_byte();
        if f.map_entry.is_erased(erased) {
            return Err(Error::EndOfFile);
        }
        f.read_addr = f.map_entry.addr;
        f.read_run = f.map_entry.count as u16;
        Ok(())
    }

    fn inc_write_addr(&mut self, f: &mut OpenFile) -> Result<()> {
        if f.write_run > 1 {
            f.write_run -= 1;
            f.write_addr = f.write_addr.next(&self.media.layout.geo)?;
            return Ok(());
        }
        map::read_next_map_entry(&mut self.media, f)?;
        let erased = self.media.layout.erased_byte();
        if f.map_entry.is_erased(erased) {
            return Err(Error::EndOfFile);
        }
        f.write_addr = f.map_entry.addr;
        f.write_run = f.map_entry.count as u16;
        Ok(())
    }

    /// Read from the current position, at most to the end of the file.
    /// Returns the number of bytes read; zero at end of file.
    pub fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        let idx = self.public_slot(id)?;
        self.with_file(Slot::Public(idx), |fs, f| fs.read_file(f, buf))
    }

    pub(crate) fn read_file(&mut self, f: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        if !f.open {
            return Err(Error::General);
        }
        if !f.mode.read {
            return Err(Error::InvalidOpenMode);
        }
        let page = self.media.layout.geo.page_bytes;
        let size = f.entry.logical_size();
        if f.read_pos >= size {
            return Ok(0);
        }
        let mut remaining = buf.len().min((size - f.read_pos) as usize);
        let mut done = 0usize;
        while remaining > 0 {
            let po = f.read_pos as usize % page;
            let chunk = remaining.min(page - po);
            if !f.read_addr.is_valid() {
                return Err(Error::EndOfFile);
            }
            let addr = f.read_addr;
            self.delta
                .read(&mut self.media, &self.header, addr, po, &mut buf[done..done + chunk])?;
            f.read_pos += chunk as u32;
            remaining -= chunk;
            done += chunk;
            if po + chunk == page {
                match self.inc_read_addr(f) {
                    Ok(()) => {}
                    Err(Error::EndOfFile) if remaining == 0 => {
                        f.read_addr = PageAddr::INVALID;
                        f.read_run = 0;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if !f.mode.append {
            f.write_pos = f.read_pos;
            f.write_addr = f.read_addr;
            f.write_run = f.read_run;
        }
        Ok(done)
    }

    /// Write at the current position. Overwrites run through the delta
    /// protocol; appends allocate fresh page runs biased toward the
    /// least-weared blocks.
    pub fn write(&mut self, id: FileId, buf: &[u8]) -> Result<usize> {
        let idx = self.public_slot(id)?;
        {
            let f = &self.files[idx];
            if !f.mode.write {
                let r = Err(Error::InvalidOpenMode);
                return self.record(r);
            }
            if f.entry.attrib & entry::ATTR_READONLY != 0 {
                let r = Err(Error::InvalidOpenMode);
                return self.record(r);
            }
        }
        // All compaction happens before the write touches anything, so the
        // slot is never reopened mid-operation.
        if !self.merging {
            let (data_pages, delta_slots) = self.write_demand(idx, buf.len());
            self.merge_check(Some(idx), data_pages, delta_slots)?;
        }
        self.with_file(Slot::Public(idx), |fs, f| fs.write_file(f, buf))
    }

    /// Worst-case page and delta-slot demand of a write, used by the
    /// upfront merge check.
    fn write_demand(&self, idx: usize, len: usize) -> (usize, usize) {
        let f = &self.files[idx];
        let page = self.media.layout.geo.page_bytes as u32;
        let size = f.entry.logical_size();
        let pos = if f.mode.append { size } else { f.write_pos };
        let end = pos.saturating_add(len as u32);
        let overwrite_end = end.min(size);
        let overwrite_pages = if pos < overwrite_end {
            (overwrite_end.div_ceil(page) - pos / page) as usize
        } else {
            0
        };
        let append_pages = if end > size {
            (end.div_ceil(page) - size.div_ceil(page)) as usize
        } else {
            0
        };
        (append_pages, overwrite_pages)
    }

    pub(crate) fn write_file(&mut self, f: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        if !f.open {
            return Err(Error::General);
        }
        if !f.mode.write {
            return Err(Error::InvalidOpenMode);
        }
        if f.mode.append && f.write_pos != f.entry.logical_size() {
            self.seek_file(f, SeekFrom::Start(f.entry.logical_size()))?;
        }
        let page = self.media.layout.geo.page_bytes;
        let geo = self.media.layout.geo;
        let mut data = buf;
        let mut written = 0usize;
        let mut map_slot_checked = false;

        while !data.is_empty() {
            let size = f.entry.logical_size();
            let pos = f.write_pos;
            let po = pos as usize % page;
            if pos < size {
                // Overwrite existing pages through the delta protocol
                let chunk = data
                    .len()
                    .min(page - po)
                    .min((size - pos) as usize);
                if !f.write_addr.is_valid() {
                    return Err(Error::InternalRange);
                }
                let addr = f.write_addr;
                self.delta
                    .write(&mut self.media, &self.header, addr, po, &data[..chunk])?;
                f.write_pos += chunk as u32;
                if po + chunk == page {
                    match self.inc_write_addr(f) {
                        Ok(()) => {}
                        Err(Error::EndOfFile) => {
                            f.write_addr = PageAddr::INVALID;
                            f.write_run = 0;
                        }
                        Err(e) => return Err(e),
                    }
                }
                data = &data[chunk..];
                written += chunk;
            } else if po != 0 {
                // The last allocated page has erased tail space
                let chunk = data.len().min(page - po);
                if !f.write_addr.is_valid() {
                    return Err(Error::InternalRange);
                }
                let addr = f.write_addr;
                self.delta
                    .write(&mut self.media, &self.header, addr, po, &data[..chunk])?;
                f.write_pos += chunk as u32;
                f.entry.size = f.write_pos;
                f.size_changed = true;
                data = &data[chunk..];
                written += chunk;
            } else {
                // Fresh pages are needed
                if !map_slot_checked {
                    map_slot_checked = true;
                    if f.map_addr.is_valid()
                        && !map::has_free_map_entry(&mut self.media, f)?
                    {
                        let (free_mgmt, _) =
                            fsbm::count_pages(&mut self.media, &self.header, true)?;
                        if free_mgmt == 0 {
                            return Err(Error::NoMoreSpace);
                        }
                    }
                }
                let needed = data.len().div_ceil(page).min(MAP_RUN_MAX);
                let (run, found) = wear::find_free_pages_wl(
                    &mut self.media,
                    &self.header,
                    1,
                    needed,
                    BlockType::Data,
                )?;
                let mut addr = run;
                let mut used: u8 = 0;
                while (used as usize) < found && !data.is_empty() {
                    let chunk = data.len().min(page);
                    let w = self
                        .delta
                        .write(&mut self.media, &self.header, addr, 0, &data[..chunk])?;
                    if w.is_delta {
                        // A freshly found free page is always programmable
                        log::warn!("append to {addr} unexpectedly took a delta page");
                    }
                    f.write_addr = addr;
                    f.write_run = 1;
                    f.write_pos += chunk as u32;
                    f.entry.size = f.write_pos;
                    f.size_changed = true;
                    data = &data[chunk..];
                    written += chunk;
                    used += 1;
                    if (used as usize) < found {
                        addr = addr.next(&geo)?;
                    }
                }
                map::append_map_entry(&mut self.media, &self.header, f, run, used)?;
            }
        }

        if !f.mode.append {
            f.read_pos = f.write_pos;
            f.read_addr = f.write_addr;
            f.read_run = f.write_run;
        }
        Ok(written)
    }

    /// Move the read/write position.
    ///
    /// Seeking backward rewinds the map walk from the start; seeking past
    /// the end of file in a writable mode pads the gap with the configured
    /// fill byte by writing real pages.
    pub fn seek(&mut self, id: FileId, from: SeekFrom) -> Result<u32> {
        let idx = self.public_slot(id)?;
        // Gap fill allocates pages, give compaction a chance first
        if !self.merging {
            if let Some(gap) = self.seek_gap(idx, from) {
                let page = self.media.layout.geo.page_bytes;
                self.merge_check(Some(idx), gap.div_ceil(page as u32) as usize, 0)?;
            }
        }
        self.with_file(Slot::Public(idx), |fs, f| fs.seek_file(f, from))
    }

    fn seek_target(f: &OpenFile, from: SeekFrom) -> Result<u32> {
        let size = f.entry.logical_size() as i64;
        let target = match from {
            SeekFrom::Start(t) => t as i64,
            SeekFrom::Current(o) => f.read_pos as i64 + o,
            SeekFrom::End(o) => {
                if f.entry.size == SIZE_ERASED {
                    return Err(Error::SeekNotPossible);
                }
                size + o
            }
        };
        if target < 0 || target > u32::MAX as i64 {
            return Err(Error::SeekNotPossible);
        }
        Ok(target as u32)
    }

    fn seek_gap(&self, idx: usize, from: SeekFrom) -> Option<u32> {
        let f = &self.files[idx];
        if !f.mode.write || !self.media.layout.cfg.seek_beyond_eof {
            return None;
        }
        let target = Self::seek_target(f, from).ok()?;
        let size = f.entry.logical_size();
        (target > size).then(|| target - size)
    }

    pub(crate) fn seek_file(&mut self, f: &mut OpenFile, from: SeekFrom) -> Result<u32> {
        if !f.open {
            return Err(Error::General);
        }
        let target = Self::seek_target(f, from)?;
        let size = f.entry.logical_size();
        let page = self.media.layout.geo.page_bytes;

        let reachable = target.min(size);
        if reachable < f.read_pos {
            self.rewind_cursor(f)?;
        }
        let mut advance = reachable - f.read_pos;
        while advance > 0 {
            let po = f.read_pos as usize % page;
            let chunk = (advance as usize).min(page - po);
            f.read_pos += chunk as u32;
            advance -= chunk as u32;
            if po + chunk == page {
                match self.inc_read_addr(f) {
                    Ok(()) => {}
                    Err(Error::EndOfFile) if advance == 0 => {
                        f.read_addr = PageAddr::INVALID;
                        f.read_run = 0;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        f.write_pos = f.read_pos;
        f.write_addr = f.read_addr;
        f.write_run = f.read_run;

        if target > size {
            if !f.mode.write || !self.media.layout.cfg.seek_beyond_eof {
                return Err(Error::SeekNotPossible);
            }
            let fill = if self.media.layout.cfg.seek_fill_erased {
                self.media.layout.erased_byte()
            } else {
                self.media.layout.programmed_byte()
            };
            let filler = vec![fill; page];
            let mut gap = (target - size) as usize;
            while gap > 0 {
                let chunk = gap.min(page);
                self.write_file(f, &filler[..chunk])?;
                gap -= chunk;
            }
        }
        Ok(f.read_pos)
    }

    fn rewind_cursor(&mut self, f: &mut OpenFile) -> Result<()> {
        f.read_pos = 0;
        f.write_pos = 0;
        self.load_first_map(f)
    }

    /// Reset both positions to the start of the file.
    pub fn rewind(&mut self, id: FileId) -> Result<()> {
        let idx = self.public_slot(id)?;
        self.with_file(Slot::Public(idx), |fs, f| fs.rewind_cursor(f))
    }

    /// Current read position.
    pub fn tell(&self, id: FileId) -> Result<u32> {
        let idx = self.public_slot(id)?;
        Ok(self.files[idx].read_pos)
    }

    /// True when the read position sits at the end of the file.
    pub fn eof(&self, id: FileId) -> Result<bool> {
        let idx = self.public_slot(id)?;
        let f = &self.files[idx];
        Ok(f.read_pos == f.entry.logical_size())
    }

    /// Last error recorded on this handle.
    pub fn file_error(&self, id: FileId) -> Result<Option<Error>> {
        let idx = self.public_slot(id)?;
        Ok(self.files[idx].error)
    }

    /// Push the size and metadata into the entry table and flush the cache.
    pub fn flush(&mut self, id: FileId) -> Result<()> {
        let idx = self.public_slot(id)?;
        self.with_file(Slot::Public(idx), |fs, f| fs.flush_file(f))
    }

    pub(crate) fn flush_file(&mut self, f: &mut OpenFile) -> Result<()> {
        if f.open && f.mode.write && f.size_changed {
            self.update_file_entry(f)?;
            f.size_changed = false;
        }
        self.media.flush()
    }

    fn update_file_entry(&mut self, f: &mut OpenFile) -> Result<()> {
        let name = f.entry.name.clone();
        let r = entry::update_entry(
            &mut self.media,
            &self.header,
            &mut self.delta,
            f.list_addr,
            &name,
            &f.entry,
        );
        match r {
            Err(Error::NoMoreEntry) if !self.merging => {
                self.merge()?;
                f.list_addr = self.list_for_dir(&f.dir_name)?;
                entry::update_entry(
                    &mut self.media,
                    &self.header,
                    &mut self.delta,
                    f.list_addr,
                    &name,
                    &f.entry,
                )
            }
            other => other,
        }
    }

    /// Flush and release the handle.
    pub fn close(&mut self, id: FileId) -> Result<()> {
        let idx = self.public_slot(id)?;
        self.with_file(Slot::Public(idx), |fs, f| fs.close_file(f))
    }

    pub(crate) fn close_file(&mut self, f: &mut OpenFile) -> Result<()> {
        let r = self.flush_file(f);
        f.open = false;
        f.in_use = false;
        r
    }

    /// Per-file user metadata.
    pub fn user_data(&self, id: FileId) -> Result<Vec<u8>> {
        let idx = self.public_slot(id)?;
        Ok(self.files[idx].entry.user_data.clone())
    }

    /// Replace the user metadata and update the entry immediately.
    pub fn set_user_data(&mut self, id: FileId, data: &[u8]) -> Result<()> {
        let idx = self.public_slot(id)?;
        if data.len() != self.media.layout.cfg.user_data_bytes {
            let r = Err(Error::Configuration);
            return self.record(r);
        }
        let data = data.to_vec();
        self.with_file(Slot::Public(idx), |fs, f| {
            f.entry.user_data = data;
            fs.update_file_entry(f)
        })
    }

    /// Size of a file by path.
    pub fn file_size(&mut self, path: &str) -> Result<u32> {
        let r = self.file_size_inner(path);
        self.record(r)
    }

    fn file_size_inner(&mut self, path: &str) -> Result<u32> {
        let (list, _, leaf) = self.resolve_parent(path)?;
        let e = entry::find_entry(&mut self.media, &self.header, &mut self.delta, list, &leaf)?;
        if e.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(e.logical_size())
    }

    /// Whether a file or directory with this path exists.
    pub fn exists(&mut self, path: &str) -> bool {
        let Ok((list, _, leaf)) = self.resolve_parent(path) else {
            return false;
        };
        if check_filename(&leaf, self.media.layout.cfg.filename_len_max).is_err() {
            return false;
        }
        entry::find_entry(&mut self.media, &self.header, &mut self.delta, list, &leaf).is_ok()
    }

    /// Delete a file: mark its entry deleted and every page of its map
    /// chain to-be-released.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let r = self.remove_inner(path);
        self.record(r)
    }

    fn remove_inner(&mut self, path: &str) -> Result<()> {
        let (list, dir_name, leaf) = self.resolve_parent(path)?;
        check_filename(&leaf, self.media.layout.cfg.filename_len_max)?;
        self.with_file(Slot::Internal, |fs, f| {
            fs.open_file(f, list, dir_name, &leaf, Some(Mode::READ), false)?;
            entry::delete_entry(&mut fs.media, &fs.header, &mut fs.delta, list, &leaf)?;
            map::release_file_pages(&mut fs.media, &fs.header, &mut fs.delta, &f.entry)?;
            fs.close_file(f)
        })
    }

    /// Rename a file, replacing the target when it exists.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let r = self.rename_inner(old, new);
        self.record(r)
    }

    fn rename_inner(&mut self, old: &str, new: &str) -> Result<()> {
        let (old_list, _, old_leaf) = self.resolve_parent(old)?;
        check_filename(&old_leaf, self.media.layout.cfg.filename_len_max)?;
        let (new_list, _, new_leaf) = self.resolve_parent(new)?;
        check_filename(&new_leaf, self.media.layout.cfg.filename_len_max)?;
        if old_list == new_list && old_leaf == new_leaf {
            return Ok(());
        }

        let target = entry::find_entry(
            &mut self.media,
            &self.header,
            &mut self.delta,
            new_list,
            &new_leaf,
        );
        match target {
            Ok(_) => self.remove(new)?,
            Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }

        let (mut e, slot) = entry::find_slot(
            &mut self.media,
            &self.header,
            &mut self.delta,
            old_list,
            &old_leaf,
        )?;
        // The map chain moves to the new record. Append the new name
        // before retiring the old slot, so a power loss in between leaves
        // both names pointing at intact data rather than neither.
        let old = e.clone();
        e.name = new_leaf;
        entry::append_entry(&mut self.media, &self.header, &mut self.delta, new_list, &e)?;
        entry::supersede_slot(&mut self.media, &self.header, &mut self.delta, slot, &old)
    }

    /// Copy a file, streaming one logical page at a time.
    pub fn copy(&mut self, from: &str, to: &str) -> Result<()> {
        let r = self.copy_inner(from, to);
        self.record(r)
    }

    fn copy_inner(&mut self, from: &str, to: &str) -> Result<()> {
        let (from_list, _, from_leaf) = self.resolve_parent(from)?;
        let (to_list, _, to_leaf) = self.resolve_parent(to)?;
        if from_list == to_list && from_leaf == to_leaf {
            return Err(Error::FileAlreadyExist);
        }
        let src = self.open(from, Mode::READ)?;
        let dst = match self.open(to, Mode::WRITE) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.close(src);
                return Err(e);
            }
        };
        let page = self.media.layout.geo.page_bytes;
        let mut buf = vec![0u8; page];
        let mut status = Ok(());
        loop {
            let n = match self.read(src, &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    status = Err(e);
                    break;
                }
            };
            if let Err(e) = self.write(dst, &buf[..n]) {
                status = Err(e);
                break;
            }
        }
        let c1 = self.close(dst);
        let c2 = self.close(src);
        status.and(c1).and(c2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Mode {
        s.parse().unwrap()
    }

    #[test]
    fn classic_mode_strings() {
        assert_eq!(parse("r"), Mode::READ);
        assert_eq!(parse("w"), Mode::WRITE);
        assert_eq!(parse("a"), Mode::APPEND);

        let rp = parse("r+");
        assert!(rp.read && rp.write && rp.must_exist && !rp.truncate);
        let wp = parse("w+");
        assert!(wp.read && wp.write && wp.truncate && !wp.must_exist);
        let ap = parse("a+");
        assert!(ap.read && ap.write && ap.append);
        // A binary suffix is accepted and changes nothing
        assert_eq!(parse("rb"), Mode::READ);
        assert_eq!(parse("wb+"), parse("w+"));
    }

    #[test]
    fn contradictory_or_unknown_modes_fail() {
        assert!("".parse::<Mode>().is_err());
        assert!("+".parse::<Mode>().is_err());
        assert!("x".parse::<Mode>().is_err());
        assert!("rw".parse::<Mode>().is_err());
    }
}
