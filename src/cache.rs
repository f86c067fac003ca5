use crate::addr::PageAddr;
use crate::config::Layout;
use crate::device::FlashDevice;
use crate::error::Result;

/// Device plus the single-slot logical-page cache.
///
/// Every management and data access of the file system goes through this
/// layer; it is the only place where a logical page is translated into its
/// backing flash pages. The cache is write-back: a dirty page is flushed
/// when another page is needed or when a caller forces it.
pub(crate) struct Media<D: FlashDevice> {
    pub dev: D,
    pub layout: Layout,
    cache_addr: PageAddr,
    cache: Vec<u8>,
    dirty: bool,
}

impl<D: FlashDevice> Media<D> {
    pub fn new(dev: D, layout: Layout) -> Self {
        let page_bytes = layout.geo.page_bytes;
        Media {
            dev,
            layout,
            cache_addr: PageAddr::INVALID,
            cache: vec![0; page_bytes],
            dirty: false,
        }
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    /// Write the cached page back to flash if it holds unsaved changes.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let fppl = self.layout.geo.flash_pages_per_logical;
        let fpb = self.layout.geo.flash_page_bytes;
        for i in 0..fppl {
            let flash_page = self.cache_addr.page as usize * fppl + i;
            self.dev.program(
                self.cache_addr.block,
                flash_page as u16,
                0,
                &self.cache[i * fpb..(i + 1) * fpb],
            )?;
        }
        log::trace!("flushed cache page {}", self.cache_addr);
        self.dirty = false;
        Ok(())
    }

    fn fill(&mut self, addr: PageAddr) -> Result<()> {
        let fppl = self.layout.geo.flash_pages_per_logical;
        let fpb = self.layout.geo.flash_page_bytes;
        for i in 0..fppl {
            let flash_page = addr.page as usize * fppl + i;
            self.dev.read(
                addr.block,
                flash_page as u16,
                0,
                &mut self.cache[i * fpb..(i + 1) * fpb],
            )?;
        }
        self.cache_addr = addr;
        Ok(())
    }

    /// Cached read of part of a logical page.
    pub fn read(&mut self, addr: PageAddr, offset: usize, buf: &mut [u8]) -> Result<()> {
        if addr != self.cache_addr {
            self.flush()?;
            self.fill(addr)?;
        }
        buf.copy_from_slice(&self.cache[offset..offset + buf.len()]);
        Ok(())
    }

    /// Bring a logical page into the cache and borrow its content.
    pub fn load(&mut self, addr: PageAddr) -> Result<&[u8]> {
        if addr != self.cache_addr {
            self.flush()?;
            self.fill(addr)?;
        }
        Ok(&self.cache)
    }

    /// Cached write of part of a logical page.
    ///
    /// Partial writes fetch the page first so the untouched bytes keep
    /// their current content when the page is flushed.
    pub fn write(&mut self, addr: PageAddr, offset: usize, buf: &[u8]) -> Result<()> {
        if addr != self.cache_addr {
            self.flush()?;
            if offset != 0 || buf.len() != self.layout.geo.page_bytes {
                self.fill(addr)?;
            } else {
                self.cache_addr = addr;
            }
        }
        self.cache[offset..offset + buf.len()].copy_from_slice(buf);
        self.dirty = true;
        Ok(())
    }

    /// Erase a block. A cached page inside it is silently forgotten.
    pub fn erase_block(&mut self, block: u16) -> Result<()> {
        log::debug!("erasing block {block}");
        self.dev.erase(block)?;
        if block == self.cache_addr.block {
            self.cache_addr = PageAddr::INVALID;
            self.dirty = false;
        }
        Ok(())
    }

    /// True when every byte of the logical page reads as erased.
    pub fn is_page_erased(&mut self, addr: PageAddr) -> Result<bool> {
        let erased = self.layout.erased_byte();
        let page = self.load(addr)?;
        Ok(page.iter().all(|&b| b == erased))
    }
}

/// True when `buf` contains only the erased byte value.
pub(crate) fn is_buffer_erased(buf: &[u8], erased: u8) -> bool {
    buf.iter().all(|&b| b == erased)
}

/// True when `buf` contains only the programmed byte value.
pub(crate) fn is_buffer_programmed(buf: &[u8], erased: u8) -> bool {
    buf.iter().all(|&b| b == !erased)
}

/// True when `new` can be programmed over `old` without an erase, i.e.
/// every differing bit flips toward the programmed polarity.
pub(crate) fn is_buffer_programmable(old: &[u8], new: &[u8], erased: u8) -> bool {
    old.iter().zip(new).all(|(&o, &n)| {
        if erased == 0xFF {
            (o ^ n) & n == 0
        } else {
            (o ^ n) & o == 0
        }
    })
}
