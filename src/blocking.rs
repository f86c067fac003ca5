//! `embedded-storage` adapters for the simulator.
//!
//! The flat-offset trait interface is mapped onto the simulator's
//! (block, page, offset) addressing so the device slots into anything
//! expecting a `NorFlash`. The async traits delegate to the blocking
//! implementations.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::device::{DeviceError, FlashDevice};
use crate::sim::SimulatedNorFlash;

impl NorFlashError for DeviceError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> ErrorType
    for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    type Error = DeviceError;
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> ReadNorFlash
    for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > self.size() {
            return Err(DeviceError::Read);
        }
        let mut pos = offset as usize;
        let mut bytes = bytes;
        while !bytes.is_empty() {
            let block = (pos / (PAGE * PAGES)) as u16;
            let page = (pos / PAGE % PAGES) as u16;
            let in_page = pos % PAGE;
            let chunk = bytes.len().min(PAGE - in_page);
            let (head, tail) = bytes.split_at_mut(chunk);
            FlashDevice::read(self, block, page, in_page, head)?;
            bytes = tail;
            pos += chunk;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.size()
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize> NorFlash
    for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = PAGE * PAGES;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % Self::ERASE_SIZE as u32 != 0 || to % Self::ERASE_SIZE as u32 != 0 || from >= to {
            return Err(DeviceError::Erase);
        }
        for block in from / Self::ERASE_SIZE as u32..to / Self::ERASE_SIZE as u32 {
            FlashDevice::erase(self, block as u16)?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > self.size() {
            return Err(DeviceError::Program);
        }
        let mut pos = offset as usize;
        let mut bytes = bytes;
        while !bytes.is_empty() {
            let block = (pos / (PAGE * PAGES)) as u16;
            let page = (pos / PAGE % PAGES) as u16;
            let in_page = pos % PAGE;
            let chunk = bytes.len().min(PAGE - in_page);
            FlashDevice::program(self, block, page, in_page, &bytes[..chunk])?;
            bytes = &bytes[chunk..];
            pos += chunk;
        }
        Ok(())
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize>
    embedded_storage_async::nor_flash::ReadNorFlash for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        ReadNorFlash::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.size()
    }
}

impl<const PAGE: usize, const PAGES: usize, const BLOCKS: usize>
    embedded_storage_async::nor_flash::NorFlash for SimulatedNorFlash<PAGE, PAGES, BLOCKS>
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = PAGE * PAGES;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        NorFlash::erase(self, from, to)
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        NorFlash::write(self, offset, bytes)
    }
}
