//! Directory handles and path resolution.
//!
//! Directories are entries with the DIR attribute whose first map address
//! names an inner entry table allocated from the management area. Path
//! resolution is purely syntactic: split on the separator, handle `.` and
//! `..`, resolve against the mount's current working directory. One
//! directory level is supported; nested paths are rejected.

use crate::addr::PageAddr;
use crate::device::FlashDevice;
use crate::entry::{self, ATTR_ARCHIVE, ATTR_DIR, Entry};
use crate::error::{Error, Result};
use crate::fs::Fs;
use crate::fsbm;
use crate::header::BlockType;
use crate::wear;

/// Handle to an open directory listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirId(pub(crate) usize);

/// One slot of the bounded open-directory table.
#[derive(Clone, Debug)]
pub(crate) struct OpenDir {
    pub in_use: bool,
    pub list: PageAddr,
    /// Name of the listed directory, `None` for the root. Lets a merge
    /// re-resolve the listing into the new management area.
    pub dir_name: Option<String>,
    pub index: usize,
    pub include_deleted: bool,
}

impl OpenDir {
    pub fn new() -> OpenDir {
        OpenDir {
            in_use: false,
            list: PageAddr::INVALID,
            dir_name: None,
            index: 0,
            include_deleted: false,
        }
    }
}

/// Directory listing record handed out by [`Fs::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Attribute bits, see the `ATTR_*` constants.
    pub attrib: u8,
    pub size: u32,
    pub user_data: Vec<u8>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attrib & ATTR_DIR != 0
    }

    fn from_entry(e: &Entry) -> DirEntry {
        DirEntry {
            name: e.name.clone(),
            attrib: e.attrib,
            size: e.logical_size(),
            user_data: e.user_data.clone(),
        }
    }
}

/// Reject names that are empty, too long or contain characters the entry
/// table cannot round-trip.
pub(crate) fn check_filename(name: &str, len_max: usize) -> Result<()> {
    const INVALID: &str = "\"'*,:;<=>?[]|";
    if name.is_empty() || name.len() > len_max {
        return Err(Error::InvalidFileName);
    }
    if name
        .chars()
        .any(|c| INVALID.contains(c) || c == '/' || c == '\\' || c == '\0')
    {
        return Err(Error::InvalidFileName);
    }
    Ok(())
}

impl<D: FlashDevice> Fs<D> {
    /// Split a path into normalized components, resolving relative paths
    /// against the current working directory.
    fn components(&self, path: &str) -> Vec<String> {
        let sep = self.media.layout.cfg.path_separator;
        let mut parts: Vec<String> = Vec::new();
        if !path.starts_with(sep) {
            parts.extend(
                self.cwd
                    .split(sep)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            );
        }
        for c in path.split(sep) {
            match c {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other.to_string()),
            }
        }
        parts
    }

    /// Resolve the directory part of a path naming a file.
    ///
    /// Returns the entry list holding the leaf, the directory name (when
    /// not the root) and the leaf name itself.
    pub(crate) fn resolve_parent(
        &mut self,
        path: &str,
    ) -> Result<(PageAddr, Option<String>, String)> {
        let mut parts = self.components(path);
        let leaf = parts.pop().ok_or(Error::InvalidFileName)?;
        let (list, dir) = self.lookup_dir_chain(&parts)?;
        Ok((list, dir, leaf))
    }

    /// Resolve a path naming a directory (or the root) to its entry list.
    pub(crate) fn resolve_dir_list(&mut self, path: &str) -> Result<(PageAddr, Option<String>)> {
        let parts = self.components(path);
        self.lookup_dir_chain(&parts)
    }

    fn lookup_dir_chain(&mut self, parts: &[String]) -> Result<(PageAddr, Option<String>)> {
        match parts {
            [] => Ok((self.header.entry_list, None)),
            [dir] => {
                let root = self.header.entry_list;
                let e = entry::find_entry(&mut self.media, &self.header, &mut self.delta, root, dir)?;
                if !e.is_dir() {
                    return Err(Error::NotADirectory);
                }
                Ok((e.first_map, Some(dir.clone())))
            }
            _ => {
                log::debug!("nested directories are not supported");
                Err(Error::NotADirectory)
            }
        }
    }

    /// Open a directory for listing. Deleted entries are skipped.
    pub fn open_dir(&mut self, path: &str) -> Result<DirId> {
        let r = self.open_dir_inner(path, false);
        self.record(r)
    }

    /// Diagnostic listing that also yields deleted entries.
    pub fn open_dir_diagnostic(&mut self, path: &str) -> Result<DirId> {
        let r = self.open_dir_inner(path, true);
        self.record(r)
    }

    fn open_dir_inner(&mut self, path: &str, include_deleted: bool) -> Result<DirId> {
        let (list, dir_name) = self.resolve_dir_list(path)?;
        let slot = self
            .dirs
            .iter()
            .position(|d| !d.in_use)
            .ok_or(Error::NoMoreResource)?;
        self.dirs[slot] = OpenDir {
            in_use: true,
            list,
            dir_name,
            index: 0,
            include_deleted,
        };
        Ok(DirId(slot))
    }

    /// Next entry of the listing, `None` at the end.
    pub fn read_dir(&mut self, id: DirId) -> Result<Option<DirEntry>> {
        let r = self.read_dir_inner(id);
        self.record(r)
    }

    fn read_dir_inner(&mut self, id: DirId) -> Result<Option<DirEntry>> {
        let dir = self.dirs.get(id.0).ok_or(Error::General)?;
        if !dir.in_use {
            return Err(Error::General);
        }
        let (list, include_deleted) = (dir.list, dir.include_deleted);
        let mut index = dir.index;
        loop {
            let read = entry::read_indexed(&mut self.media, &self.header, &mut self.delta, list, index);
            match read {
                Ok(Some(e)) => {
                    index += 1;
                    if e.is_deleted() && !include_deleted {
                        continue;
                    }
                    self.dirs[id.0].index = index;
                    return Ok(Some(DirEntry::from_entry(&e)));
                }
                // An erased slot or the end of the list ends the walk
                Ok(None) | Err(Error::NoMoreEntry) => {
                    self.dirs[id.0].index = index;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a directory handle.
    pub fn close_dir(&mut self, id: DirId) -> Result<()> {
        if matches!(self.dirs.get(id.0), Some(d) if d.in_use) {
            self.dirs[id.0].in_use = false;
            Ok(())
        } else {
            let r = Err(Error::General);
            self.record(r)
        }
    }

    /// Create a directory in the root.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let r = self.mkdir_inner(path);
        self.record(r)
    }

    fn mkdir_inner(&mut self, path: &str) -> Result<()> {
        let (_, dir, leaf) = self.resolve_parent(path)?;
        if dir.is_some() {
            // One directory level only
            return Err(Error::NotADirectory);
        }
        check_filename(&leaf, self.media.layout.cfg.filename_len_max)?;
        let root = self.header.entry_list;
        match entry::find_entry(&mut self.media, &self.header, &mut self.delta, root, &leaf) {
            Ok(_) => return Err(Error::FileAlreadyExist),
            Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }

        let pages = self.media.layout.entry_list_pages;
        for attempt in 0..2 {
            let created = self.try_mkdir(&leaf, pages);
            match created {
                Err(Error::NoMoreEntry) | Err(Error::NoMoreSpace)
                    if attempt == 0 && !self.merging =>
                {
                    self.merge()?;
                }
                other => return other,
            }
        }
        Err(Error::NoMoreSpace)
    }

    fn try_mkdir(&mut self, name: &str, pages: usize) -> Result<()> {
        let (list, found) = wear::find_free_pages_wl(
            &mut self.media,
            &self.header,
            pages,
            pages,
            BlockType::PrimaryMgmt,
        )?;
        if found < pages {
            return Err(Error::NoMoreSpace);
        }
        let user_data = self.media.layout.cfg.user_data_bytes;
        let e = Entry::new(name, ATTR_ARCHIVE | ATTR_DIR, list, user_data);
        let root = self.header.entry_list;
        entry::append_entry(&mut self.media, &self.header, &mut self.delta, root, &e)?;
        fsbm::mark_pages(&mut self.media, &self.header, list, pages, fsbm::Mark::Used)?;
        log::debug!("directory '{name}' created, entry list at {list}");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let r = self.rmdir_inner(path);
        self.record(r)
    }

    fn rmdir_inner(&mut self, path: &str) -> Result<()> {
        let mut parts = self.components(path);
        let leaf = parts.pop().ok_or(Error::InvalidFileName)?;
        if !parts.is_empty() {
            return Err(Error::NotADirectory);
        }
        let root = self.header.entry_list;
        let e = entry::find_entry(&mut self.media, &self.header, &mut self.delta, root, &leaf)?;
        if !e.is_dir() {
            return Err(Error::NotADirectory);
        }
        let mut index = 0;
        loop {
            match entry::read_indexed(
                &mut self.media,
                &self.header,
                &mut self.delta,
                e.first_map,
                index,
            ) {
                Ok(Some(inner)) => {
                    if !inner.is_deleted() {
                        return Err(Error::DirectoryNotEmpty);
                    }
                    index += 1;
                }
                Ok(None) | Err(Error::NoMoreEntry) => break,
                Err(err) => return Err(err),
            }
        }
        entry::delete_entry(&mut self.media, &self.header, &mut self.delta, root, &leaf)?;
        let pages = self.media.layout.entry_list_pages;
        fsbm::mark_pages(
            &mut self.media,
            &self.header,
            e.first_map,
            pages,
            fsbm::Mark::ToBeReleased,
        )?;
        if self.cwd_dir_name().as_deref() == Some(leaf.as_str()) {
            self.cwd = self.media.layout.cfg.path_separator.to_string();
        }
        Ok(())
    }

    /// Change the current working directory.
    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let r = self.chdir_inner(path);
        self.record(r)
    }

    fn chdir_inner(&mut self, path: &str) -> Result<()> {
        let (_, dir) = self.resolve_dir_list(path)?;
        let sep = self.media.layout.cfg.path_separator;
        self.cwd = match dir {
            None => sep.to_string(),
            Some(name) => format!("{sep}{name}"),
        };
        Ok(())
    }

    /// Current working directory as an absolute path.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub(crate) fn cwd_dir_name(&self) -> Option<String> {
        let sep = self.media.layout.cfg.path_separator;
        let trimmed = self.cwd.trim_start_matches(sep);
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}
