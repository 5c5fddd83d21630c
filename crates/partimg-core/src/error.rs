//! Error types for the partimg core library

use thiserror::Error;

/// `errno` value the kernel reports for unreadable media
const EIO: i32 = 5;

/// Main error type for partimg operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad magic or sentinel, not a partimg container
    #[error("Format error: {0}")]
    Format(String),

    /// Header describes an impossible geometry
    #[error("Corrupt image header: {0}")]
    CorruptHeader(String),

    /// Running checksum diverged while reading an image
    #[error("Checksum mismatch at block {block}: expected {expected:#010x}, got {actual:#010x}")]
    Integrity {
        /// Block id whose tag failed to match
        block: u64,
        /// Checksum tag stored in the image
        expected: u32,
        /// Checksum folded from the data actually read
        actual: u32,
    },

    /// Allocation, free memory or free space shortfall
    #[error("Insufficient resources: {0}")]
    Resource(String),

    /// Read or write failure on a source, target or image handle
    #[error("Device I/O error at offset {offset}: {source}")]
    DeviceIo {
        /// Byte offset of the failed transfer
        offset: u64,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// Target is smaller than the imaged device
    #[error("Size mismatch: source device is {required} bytes, target is {available} bytes")]
    SizeMismatch {
        /// Bytes required by the image
        required: u64,
        /// Bytes reported by the target
        available: u64,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an I/O error with the byte offset it happened at
    pub fn device_io(offset: u64, source: std::io::Error) -> Self {
        Error::DeviceIo { offset, source }
    }

    /// Whether this is an unrecovered media error on the source
    pub fn is_bad_sector(&self) -> bool {
        matches!(self, Error::DeviceIo { source, .. } if is_media_error(source))
    }
}

/// Whether an I/O error means the medium itself could not be read
pub fn is_media_error(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(EIO)
}

/// Result type alias using the partimg error type
pub type Result<T> = std::result::Result<T, Error>;
