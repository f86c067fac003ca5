use core::fmt;

use crate::device::DeviceError;

/// File system operation result
pub type Result<T> = core::result::Result<T, Error>;

/// File system error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Unclassified failure
    General,
    /// File system has not been mounted yet
    NotInitialized,
    /// Open mode string/flags are not a valid combination
    InvalidOpenMode,
    /// File name is empty, too long or contains forbidden characters
    InvalidFileName,
    /// No entry with the given name exists
    FileNotFound,
    /// An entry with the given name already exists
    FileAlreadyExist,
    /// All file or directory handles are in use
    NoMoreResource,
    /// No free page satisfies the request, even after compaction
    NoMoreSpace,
    /// The entry table has no free slot
    NoMoreEntry,
    /// Read or map walk ran past the end of the file
    EndOfFile,
    /// Configuration is inconsistent with the device geometry or itself
    Configuration,
    /// Flash driver failed to initialize
    FlashInit,
    /// Flash read failed
    FlashRead,
    /// Flash program failed
    ///
    /// Also reported when a program would require a bit to return to the
    /// erased polarity.
    FlashWrite,
    /// Flash block erase failed
    FlashErase,
    /// Flash driver timed out
    FlashTimeout,
    /// Other flash driver failure
    FlashGeneral,
    /// Internal allocation invariant violated (double allocate/release)
    InternalAllocation,
    /// Internal address ran outside the flash geometry
    InternalRange,
    /// Seek target is not reachable in the current mode
    SeekNotPossible,
    /// Path component is not a directory
    NotADirectory,
    /// Directory given where a file was expected
    IsADirectory,
    /// Directory still contains entries
    DirectoryNotEmpty,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::General => "general failure",
            Error::NotInitialized => "file system not initialized",
            Error::InvalidOpenMode => "invalid open mode",
            Error::InvalidFileName => "invalid file name",
            Error::FileNotFound => "file not found",
            Error::FileAlreadyExist => "file already exists",
            Error::NoMoreResource => "no more handles",
            Error::NoMoreSpace => "no more space",
            Error::NoMoreEntry => "no more entry slots",
            Error::EndOfFile => "end of file",
            Error::Configuration => "invalid configuration",
            Error::FlashInit => "flash init failed",
            Error::FlashRead => "flash read failed",
            Error::FlashWrite => "flash program failed",
            Error::FlashErase => "flash erase failed",
            Error::FlashTimeout => "flash timeout",
            Error::FlashGeneral => "flash failure",
            Error::InternalAllocation => "allocation invariant violated",
            Error::InternalRange => "address out of range",
            Error::SeekNotPossible => "seek not possible",
            Error::NotADirectory => "not a directory",
            Error::IsADirectory => "is a directory",
            Error::DirectoryNotEmpty => "directory not empty",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Init => Error::FlashInit,
            DeviceError::Read => Error::FlashRead,
            DeviceError::Program => Error::FlashWrite,
            DeviceError::Erase => Error::FlashErase,
            DeviceError::Timeout => Error::FlashTimeout,
            DeviceError::Other => Error::FlashGeneral,
        }
    }
}
