use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::header;

/// File system tunables.
///
/// Geometry comes from the device; everything else is configured here and
/// validated against the device at mount time. Construct with
/// [`Config::new`] and adjust with the `with_*` methods:
///
/// ```
/// use norfs::Config;
/// let cfg = Config::new().with_logical_page_bytes(256).with_mgmt_blocks(1);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Allocation unit of the file system. Power of two, at least one
    /// flash page. Larger pages need more RAM and fewer management pages.
    pub logical_page_bytes: usize,
    /// Leading blocks never touched by the file system.
    pub reserved_blocks: u16,
    /// Blocks per management area. The file system reserves twice this.
    pub mgmt_blocks: u16,
    /// Maximum number of simultaneously open files.
    pub max_open_files: usize,
    /// Maximum number of simultaneously open directories.
    pub max_open_dirs: usize,
    /// Maximum number of entries per directory.
    pub max_entries: usize,
    /// Maximum file name length in bytes.
    pub filename_len_max: usize,
    /// How many least-weared blocks the header tracks for allocator bias.
    pub least_weared_blocks: usize,
    /// Pages reserved for the delta index in each management area.
    pub delta_map_pages: usize,
    /// Per-file user metadata size in bytes.
    pub user_data_bytes: usize,
    /// Allow `seek` past the end of file in writable modes.
    pub seek_beyond_eof: bool,
    /// Fill byte for seek-created gaps: `true` = erased polarity,
    /// `false` = programmed polarity.
    pub seek_fill_erased: bool,
    /// Verify that pages marked free really read erased while scanning.
    pub check_erased_pages: bool,
    /// Route entry-table updates through the delta index.
    pub delta_for_entries: bool,
    /// Wear-count spread that triggers the static leveler.
    pub static_wear_limit: u16,
    /// Path separator, `/` or `\`.
    pub path_separator: char,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logical_page_bytes: 256,
            reserved_blocks: 0,
            mgmt_blocks: 1,
            max_open_files: 4,
            max_open_dirs: 2,
            max_entries: 32,
            filename_len_max: 32,
            least_weared_blocks: 6,
            delta_map_pages: 2,
            user_data_bytes: 8,
            seek_beyond_eof: true,
            seek_fill_erased: false,
            check_erased_pages: true,
            delta_for_entries: false,
            static_wear_limit: 20,
            path_separator: '/',
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }
    pub fn with_logical_page_bytes(mut self, bytes: usize) -> Self {
        self.logical_page_bytes = bytes;
        self
    }
    pub fn with_reserved_blocks(mut self, blocks: u16) -> Self {
        self.reserved_blocks = blocks;
        self
    }
    pub fn with_mgmt_blocks(mut self, blocks: u16) -> Self {
        self.mgmt_blocks = blocks;
        self
    }
    pub fn with_max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }
    pub fn with_max_open_dirs(mut self, n: usize) -> Self {
        self.max_open_dirs = n;
        self
    }
    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }
    pub fn with_filename_len_max(mut self, n: usize) -> Self {
        self.filename_len_max = n;
        self
    }
    pub fn with_least_weared_blocks(mut self, n: usize) -> Self {
        self.least_weared_blocks = n;
        self
    }
    pub fn with_delta_map_pages(mut self, n: usize) -> Self {
        self.delta_map_pages = n;
        self
    }
    pub fn with_user_data_bytes(mut self, n: usize) -> Self {
        self.user_data_bytes = n;
        self
    }
    pub fn with_seek_beyond_eof(mut self, enable: bool) -> Self {
        self.seek_beyond_eof = enable;
        self
    }
    pub fn with_seek_fill_erased(mut self, erased: bool) -> Self {
        self.seek_fill_erased = erased;
        self
    }
    pub fn with_check_erased_pages(mut self, enable: bool) -> Self {
        self.check_erased_pages = enable;
        self
    }
    pub fn with_delta_for_entries(mut self, enable: bool) -> Self {
        self.delta_for_entries = enable;
        self
    }
    pub fn with_static_wear_limit(mut self, limit: u16) -> Self {
        self.static_wear_limit = limit;
        self
    }
    pub fn with_path_separator(mut self, sep: char) -> Self {
        self.path_separator = sep;
        self
    }
}

/// Resolved device geometry in logical-page terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Physical blocks on the device.
    pub blocks: u16,
    /// Leading blocks the file system never touches.
    pub reserved_blocks: u16,
    /// Logical pages per block.
    pub pages_per_block: u16,
    /// Bytes per logical page.
    pub page_bytes: usize,
    /// Bytes per flash page.
    pub flash_page_bytes: usize,
    /// Flash pages making up one logical page.
    pub flash_pages_per_logical: usize,
}

impl Geometry {
    /// Blocks available to the file system.
    pub fn fs_blocks(&self) -> u16 {
        self.blocks - self.reserved_blocks
    }

    /// Logical pages available to the file system.
    pub fn fs_pages(&self) -> usize {
        self.fs_blocks() as usize * self.pages_per_block as usize
    }

    pub fn block_bytes(&self) -> usize {
        self.pages_per_block as usize * self.page_bytes
    }
}

/// On-media record sizes, fixed across configurations.
pub(crate) const MAP_HEADER_BYTES: usize = 8;
pub(crate) const MAP_ENTRY_BYTES: usize = 5;
pub(crate) const DELTA_ENTRY_BYTES: usize = 8;
pub(crate) const WEAR_ENTRY_BYTES: usize = 3;

/// Run length limit of one map entry (`u8` count, `0xFF` erased,
/// `0xFE` invalid).
pub(crate) const MAP_RUN_MAX: usize = 0xFD;

/// Derived on-media layout: everything the size macros of a fixed-config
/// build would provide, computed once at mount.
#[derive(Clone, Debug)]
pub(crate) struct Layout {
    pub geo: Geometry,
    pub cfg: Config,
    pub entry_bytes: usize,
    pub entries_per_page: usize,
    pub entry_list_pages: usize,
    pub fsbm_bytes: usize,
    pub fsbm_pages: usize,
    pub map_entries_per_page: usize,
    pub delta_entries_per_page: usize,
    pub wear_entries_per_page: usize,
    pub wear_list_pages: usize,
    pub header_pages: usize,
    pub erased: u8,
}

impl Layout {
    pub fn new<D: FlashDevice>(dev: &D, cfg: &Config) -> Result<Layout> {
        let flash_page_bytes = dev.page_bytes();
        let lp = cfg.logical_page_bytes;
        if lp < flash_page_bytes || !lp.is_power_of_two() || lp % flash_page_bytes != 0 {
            log::error!(
                "logical page size {lp} incompatible with flash page size {flash_page_bytes}"
            );
            return Err(Error::Configuration);
        }
        let block_bytes = dev.pages_per_block() as usize * flash_page_bytes;
        if block_bytes % lp != 0 || block_bytes / lp == 0 {
            return Err(Error::Configuration);
        }
        let geo = Geometry {
            blocks: dev.blocks(),
            reserved_blocks: cfg.reserved_blocks,
            pages_per_block: (block_bytes / lp) as u16,
            page_bytes: lp,
            flash_page_bytes,
            flash_pages_per_logical: lp / flash_page_bytes,
        };

        if cfg.filename_len_max == 0
            || cfg.filename_len_max > 255
            || cfg.max_entries == 0
            || cfg.max_open_files == 0
            || cfg.max_open_dirs == 0
            || cfg.delta_map_pages == 0
            || cfg.least_weared_blocks == 0
            || cfg.mgmt_blocks == 0
        {
            return Err(Error::Configuration);
        }
        if !matches!(cfg.path_separator, '/' | '\\') {
            return Err(Error::Configuration);
        }
        if geo.blocks <= cfg.reserved_blocks
            || geo.fs_blocks() <= cfg.mgmt_blocks * 2
            || cfg.least_weared_blocks as u16 > geo.fs_blocks() - cfg.mgmt_blocks * 2
        {
            return Err(Error::Configuration);
        }

        let entry_bytes = cfg.filename_len_max + 1 + cfg.user_data_bytes + 4 + 4;
        if entry_bytes > lp {
            log::error!("entry size {entry_bytes} does not fit a logical page of {lp}");
            return Err(Error::Configuration);
        }
        let entries_per_page = lp / entry_bytes;
        let entry_list_pages = cfg.max_entries.div_ceil(entries_per_page);

        let fsbm_bytes = (geo.fs_pages() * 2).div_ceil(8);
        let fsbm_pages = fsbm_bytes.div_ceil(lp);

        let map_entries_per_page = (lp - MAP_HEADER_BYTES) / MAP_ENTRY_BYTES;
        let delta_entries_per_page = lp / DELTA_ENTRY_BYTES;
        let wear_entries_per_page = lp / WEAR_ENTRY_BYTES;
        let wear_list_pages = (geo.fs_blocks() as usize).div_ceil(wear_entries_per_page);

        let header_len = header::header_bytes(cfg.least_weared_blocks);
        if header_len > lp {
            log::error!("header of {header_len} bytes does not fit a logical page of {lp}");
            return Err(Error::Configuration);
        }
        let header_pages = header_len.div_ceil(lp);

        let layout = Layout {
            geo,
            cfg: cfg.clone(),
            entry_bytes,
            entries_per_page,
            entry_list_pages,
            fsbm_bytes,
            fsbm_pages,
            map_entries_per_page,
            delta_entries_per_page,
            wear_entries_per_page,
            wear_list_pages,
            header_pages,
            erased: dev.erased_byte(),
        };

        let mgmt_pages = cfg.mgmt_blocks as usize * geo.pages_per_block as usize;
        if layout.mgmt_pages_min() > mgmt_pages {
            log::error!(
                "management data needs {} pages but one area has only {mgmt_pages}",
                layout.mgmt_pages_min()
            );
            return Err(Error::Configuration);
        }

        Ok(layout)
    }

    /// Pages the fixed management structures occupy in one area.
    pub fn mgmt_pages_min(&self) -> usize {
        self.header_pages
            + self.entry_list_pages
            + self.fsbm_pages
            + self.cfg.delta_map_pages
            + self.wear_list_pages
    }

    /// Total delta index capacity in entries.
    pub fn delta_capacity(&self) -> usize {
        self.cfg.delta_map_pages * self.delta_entries_per_page
    }

    /// Byte value of erased media; the programmed value is its inverse.
    pub fn erased_byte(&self) -> u8 {
        self.erased
    }

    pub fn programmed_byte(&self) -> u8 {
        !self.erased
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedNorFlash;

    #[test]
    fn default_layout_fits_one_management_block() {
        let dev: SimulatedNorFlash<256, 256, 8> = SimulatedNorFlash::new();
        let layout = Layout::new(&dev, &Config::new()).unwrap();
        assert_eq!(layout.geo.pages_per_block, 256);
        assert_eq!(layout.entries_per_page, 5);
        // 8 blocks * 256 pages * 2 bits = 512 bytes of bitmap
        assert_eq!(layout.fsbm_bytes, 512);
        assert_eq!(layout.fsbm_pages, 2);
        assert!(layout.mgmt_pages_min() <= 256);
    }

    #[test]
    fn rejects_logical_page_smaller_than_flash_page() {
        let dev: SimulatedNorFlash<256, 256, 8> = SimulatedNorFlash::new();
        let cfg = Config::new().with_logical_page_bytes(128);
        assert!(matches!(Layout::new(&dev, &cfg), Err(Error::Configuration)));
    }

    #[test]
    fn rejects_too_few_blocks() {
        let dev: SimulatedNorFlash<256, 256, 8> = SimulatedNorFlash::new();
        let cfg = Config::new().with_mgmt_blocks(4);
        assert!(Layout::new(&dev, &cfg).is_err());
    }
}
