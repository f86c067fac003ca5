//! Delta index: out-of-place page updates.
//!
//! A previously written logical page cannot be reprogrammed arbitrarily, so
//! an update goes to a freshly allocated page and the mapping
//! `original → delta` is appended here. The index occupies a fixed pool of
//! management pages mirrored in RAM; lookups scan all entries and the last
//! match wins, because updates of the same page append a fresh pair keyed
//! by the original address.

use crate::addr::{self, PageAddr};
use crate::cache::{self, Media};
use crate::config::DELTA_ENTRY_BYTES;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::fsbm;
use crate::header::{BlockType, Header};

/// RAM mirror of the delta map pages.
pub(crate) struct DeltaMap {
    buf: Vec<u8>,
    loaded: bool,
}

/// Outcome of a data page write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DeltaWrite {
    /// The update went to a fresh delta page.
    pub is_delta: bool,
}

impl DeltaMap {
    pub fn new(pages: usize, page_bytes: usize, erased: u8) -> Self {
        DeltaMap {
            buf: vec![erased; pages * page_bytes],
            loaded: false,
        }
    }

    /// Drop the mirror content; the next access re-reads it from flash.
    pub fn invalidate(&mut self, erased: u8) {
        self.buf.fill(erased);
        self.loaded = false;
    }

    pub(crate) fn ensure_loaded<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
    ) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let page_bytes = media.layout.geo.page_bytes;
        let pages = media.layout.cfg.delta_map_pages;
        let mut addr = header.delta_map;
        for i in 0..pages {
            media.read(addr, 0, &mut self.buf[i * page_bytes..(i + 1) * page_bytes])?;
            if i + 1 < pages {
                addr = addr.next(&media.layout.geo)?;
            }
        }
        self.loaded = true;
        Ok(())
    }

    /// Resolve `addr` through the index to the page currently holding its
    /// content. Returns `addr` itself when no delta exists.
    pub fn resolve<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
        addr: PageAddr,
    ) -> Result<PageAddr> {
        Ok(self.resolve_with_room(media, header, addr)?.0)
    }

    /// Resolve and also report whether the index has a free slot left.
    pub fn resolve_with_room<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
        addr: PageAddr,
    ) -> Result<(PageAddr, bool)> {
        if !addr.is_valid() {
            return Err(Error::InternalRange);
        }
        self.ensure_loaded(media, header)?;
        let erased = media.layout.erased_byte();
        let mut resolved = addr;
        let mut full = true;
        for slot in self.buf.chunks_exact(DELTA_ENTRY_BYTES) {
            if cache::is_buffer_erased(slot, erased) {
                full = false;
                continue;
            }
            if addr::get_addr(slot, 0) == addr {
                resolved = addr::get_addr(slot, 4);
            }
        }
        if resolved != addr {
            log::trace!("delta {addr} -> {resolved}");
        }
        Ok((resolved, full))
    }

    /// Number of erased entry slots left in the index.
    pub fn free_slots<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
    ) -> Result<usize> {
        self.ensure_loaded(media, header)?;
        let erased = media.layout.erased_byte();
        Ok(self
            .buf
            .chunks_exact(DELTA_ENTRY_BYTES)
            .filter(|s| cache::is_buffer_erased(s, erased))
            .count())
    }

    /// Append a mapping into the first erased slot and write the owning
    /// index page back. `NoMoreSpace` means the caller has to merge first.
    fn append<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
        orig: PageAddr,
        delta: PageAddr,
    ) -> Result<()> {
        self.ensure_loaded(media, header)?;
        let erased = media.layout.erased_byte();
        let page_bytes = media.layout.geo.page_bytes;
        let entries_per_page = media.layout.delta_entries_per_page;
        let slot = self
            .buf
            .chunks_exact(DELTA_ENTRY_BYTES)
            .position(|s| cache::is_buffer_erased(s, erased))
            .ok_or(Error::NoMoreSpace)?;
        let offset = slot * DELTA_ENTRY_BYTES;
        addr::put_addr(&mut self.buf, offset, orig);
        addr::put_addr(&mut self.buf, offset + 4, delta);

        let page_idx = slot / entries_per_page;
        let page_addr = header.delta_map.add(&media.layout.geo, page_idx)?;
        media.write(
            page_addr,
            0,
            &self.buf[page_idx * page_bytes..(page_idx + 1) * page_bytes],
        )?;
        Ok(())
    }

    /// Read through the index: resolve once, then read the page content.
    pub fn read<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
        addr: PageAddr,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let resolved = self.resolve(media, header, addr)?;
        media.read(resolved, offset, buf)
    }

    /// Write through the index.
    ///
    /// If the new bytes only flip bits toward the programmed polarity the
    /// resolved page is updated in place. Otherwise the merged content goes
    /// to a fresh data page, the mapping is appended, the fresh page is
    /// marked used and the superseded one to-be-released.
    ///
    /// Fails with `NoMoreSpace` *before any mutation* when a delta would be
    /// needed but the index is full; the caller merges and retries.
    pub fn write<D: FlashDevice>(
        &mut self,
        media: &mut Media<D>,
        header: &Header,
        addr: PageAddr,
        offset: usize,
        buf: &[u8],
    ) -> Result<DeltaWrite> {
        let (resolved, full) = self.resolve_with_room(media, header, addr)?;
        let page_bytes = media.layout.geo.page_bytes;
        let erased = media.layout.erased_byte();

        let mut current = vec![0u8; page_bytes];
        media.read(resolved, 0, &mut current)?;
        let in_place =
            cache::is_buffer_programmable(&current[offset..offset + buf.len()], buf, erased);

        if in_place {
            media.write(resolved, offset, buf)?;
            if fsbm::is_page_free(media, header, resolved)? {
                fsbm::mark_pages(media, header, resolved, 1, fsbm::Mark::Used)?;
            }
            return Ok(DeltaWrite { is_delta: false });
        }

        if full {
            log::warn!("delta map is full, management areas need a merge");
            return Err(Error::NoMoreSpace);
        }
        let (fresh, _) = fsbm::find_pages(
            media,
            header,
            &fsbm::Find {
                min: 1,
                desired: 1,
                block_type: BlockType::Data,
                free: true,
                scope: fsbm::RunScope::Any,
                start_block: media.layout.geo.reserved_blocks,
                only_start_block: false,
            },
        )?;
        log::debug!("delta page {addr} -> {fresh}");

        current[offset..offset + buf.len()].copy_from_slice(buf);
        media.write(fresh, 0, &current)?;
        self.append(media, header, addr, fresh)?;
        fsbm::mark_pages(media, header, fresh, 1, fsbm::Mark::Used)?;
        fsbm::mark_pages(media, header, resolved, 1, fsbm::Mark::ToBeReleased)?;
        Ok(DeltaWrite { is_delta: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Layout};
    use crate::header as hdr;
    use crate::sim::SimulatedNorFlash;

    type Flash = SimulatedNorFlash<256, 64, 8>;

    fn setup() -> (Media<Flash>, Header, DeltaMap) {
        let dev = Flash::new();
        let layout = Layout::new(&dev, &Config::new()).unwrap();
        let mut media = Media::new(dev, layout.clone());
        let h = Header::init(&layout, 0, 0, 1).unwrap();
        hdr::write_header(&mut media, &h, true, true).unwrap();
        let dm = DeltaMap::new(
            layout.cfg.delta_map_pages,
            layout.geo.page_bytes,
            layout.erased_byte(),
        );
        (media, h, dm)
    }

    #[test]
    fn first_write_lands_in_place_and_allocates() {
        let (mut media, h, mut dm) = setup();
        let addr = PageAddr::new(2, 0);
        let w = dm.write(&mut media, &h, addr, 0, &[0xA5; 16]).unwrap();
        assert!(!w.is_delta);
        assert_eq!(dm.resolve(&mut media, &h, addr).unwrap(), addr);
        assert!(!fsbm::is_page_free(&mut media, &h, addr).unwrap());
    }

    #[test]
    fn conflicting_update_goes_to_a_delta_page() {
        let (mut media, h, mut dm) = setup();
        let addr = PageAddr::new(2, 0);
        dm.write(&mut media, &h, addr, 0, &[0x0F; 4]).unwrap();
        // 0x0F -> 0xF0 needs bits back to the erased polarity
        let w = dm.write(&mut media, &h, addr, 0, &[0xF0; 4]).unwrap();
        assert!(w.is_delta);

        let resolved = dm.resolve(&mut media, &h, addr).unwrap();
        assert_ne!(resolved, addr);
        assert!(fsbm::is_page_to_be_released(&mut media, &h, addr).unwrap());
        assert!(!fsbm::is_page_free(&mut media, &h, resolved).unwrap());

        let mut back = [0u8; 4];
        dm.read(&mut media, &h, addr, 0, &mut back).unwrap();
        assert_eq!(back, [0xF0; 4]);
    }

    #[test]
    fn unrelated_bytes_of_the_page_survive_a_delta() {
        let (mut media, h, mut dm) = setup();
        let addr = PageAddr::new(2, 0);
        dm.write(&mut media, &h, addr, 0, &[0x22; 8]).unwrap();
        // Conflict elsewhere in the page forces a delta copy
        dm.write(&mut media, &h, addr, 100, &[0x11; 8]).unwrap();
        let w = dm.write(&mut media, &h, addr, 100, &[0x22; 8]).unwrap();
        assert!(w.is_delta);
        let mut back = [0u8; 8];
        dm.read(&mut media, &h, addr, 0, &mut back).unwrap();
        assert_eq!(back, [0x22; 8]);
        dm.read(&mut media, &h, addr, 100, &mut back).unwrap();
        assert_eq!(back, [0x22; 8]);
    }

    #[test]
    fn the_latest_mapping_wins() {
        let (mut media, h, mut dm) = setup();
        let addr = PageAddr::new(2, 0);
        for v in [0x0Fu8, 0xF0, 0x0F] {
            // Alternating patterns force a fresh delta every time
            dm.write(&mut media, &h, addr, 0, &[v; 4]).unwrap();
        }
        let mut back = [0u8; 4];
        dm.read(&mut media, &h, addr, 0, &mut back).unwrap();
        assert_eq!(back, [0x0F; 4]);
    }

    #[test]
    fn a_full_index_rejects_further_deltas_untouched() {
        let (mut media, h, mut dm) = setup();
        let capacity = media.layout.delta_capacity();
        // Exhaust the index with updates of distinct pages. The originals
        // live in the top blocks so the fresh delta pages, allocated from
        // the bottom of the data area, never alias them.
        for i in 0..capacity {
            let addr = PageAddr::new(6 + (i / 60) as u16, (i % 60) as u16);
            dm.write(&mut media, &h, addr, 0, &[0x0F; 2]).unwrap();
            dm.write(&mut media, &h, addr, 0, &[0xF0; 2]).unwrap();
        }
        assert_eq!(dm.free_slots(&mut media, &h).unwrap(), 0);

        let victim = PageAddr::new(5, 0);
        dm.write(&mut media, &h, victim, 0, &[0x0F; 2]).unwrap();
        let denied = dm.write(&mut media, &h, victim, 0, &[0xF0; 2]);
        assert_eq!(denied, Err(Error::NoMoreSpace));
        // The denied update must not have touched the page
        let mut back = [0u8; 2];
        dm.read(&mut media, &h, victim, 0, &mut back).unwrap();
        assert_eq!(back, [0x0F; 2]);
    }

    #[test]
    fn the_mirror_reloads_from_flash() {
        let (mut media, h, mut dm) = setup();
        let addr = PageAddr::new(2, 0);
        dm.write(&mut media, &h, addr, 0, &[0x0F; 2]).unwrap();
        dm.write(&mut media, &h, addr, 0, &[0xF0; 2]).unwrap();
        let resolved = dm.resolve(&mut media, &h, addr).unwrap();

        // A fresh mirror, as after a remount, sees the same mapping
        let mut dm2 = DeltaMap::new(
            media.layout.cfg.delta_map_pages,
            media.layout.geo.page_bytes,
            media.layout.erased_byte(),
        );
        media.flush().unwrap();
        assert_eq!(dm2.resolve(&mut media, &h, addr).unwrap(), resolved);
    }
}
