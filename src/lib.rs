//! Journaling file system for small NOR flash devices.
//!
//! NOR flash erases in blocks, programs in pages and only ever flips bits
//! from the erased polarity toward the programmed one. This crate builds a
//! POSIX-flavored, power-loss-safe file system on top of those rules: a
//! two-bit free space bitmap drives allocation, each file's pages are
//! described by a chain of map pages, in-place updates go through delta
//! pages, and a generational merge of the management area reclaims space
//! while leveling erase wear across blocks.
//!
//! Typical use:
//! - Implement [`FlashDevice`] for your flash driver, or use the built-in
//!   [`SimulatedNorFlash`] on a host.
//! - Mount with [`Fs::mount`]; an empty device is formatted on the spot.
//! - Work with the familiar verbs: `open`, `read`, `write`, `seek`,
//!   `close`, `remove`, `rename`, directories via `mkdir`/`open_dir`.
//! - After an unplanned power loss the next mount recovers to a state
//!   where each updated page shows either its old or its new content,
//!   never a torn value.
//!
//! The simulator also implements the `embedded-storage` and
//! `embedded-storage-async` traits, so it slots into anything expecting a
//! `NorFlash`, and can inject wear-out failures and power cuts for
//! recovery testing.

mod addr;
mod blocking;
mod cache;
mod check;
mod config;
mod delta;
mod device;
mod dir;
mod entry;
mod error;
mod file;
mod fs;
mod fsbm;
mod header;
mod map;
mod merge;
mod sim;
mod transaction;
mod wear;

pub use addr::PageAddr;
pub use config::{Config, Geometry};
pub use device::{DeviceError, DeviceResult, FlashDevice};
pub use dir::{DirEntry, DirId};
pub use entry::{
    ATTR_ARCHIVE, ATTR_DELETED, ATTR_DIR, ATTR_HIDDEN, ATTR_READONLY, ATTR_SYSTEM,
};
pub use error::{Error, Result};
pub use file::{FileId, Mode, SeekFrom};
pub use fs::{Fs, SpaceInfo};
pub use sim::{FlashSnapshot, SimulatedNorFlash, SimulatedNorFlashBuilder};
pub use transaction::{Transaction, TransactionLogLevel};
