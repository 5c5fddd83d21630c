//! # partimg Platform
//!
//! Platform-specific adapters for raw device I/O and system probes.
//!
//! This crate opens block devices and regular files for imaging, reports
//! device capacity, flushes writes to stable storage, and answers the
//! questions the imaging engine asks of the host: free space on the
//! filesystem holding an image, available memory for the bitmap, and whether
//! the process runs with elevated privileges.
//!
//! ## Safety
//!
//! Writing to a block device destroys whatever it held. Callers are expected
//! to have confirmed the target before opening it for writing.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::io::{Read, Seek, Write};
use std::path::Path;
use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device access denied (need elevated privileges)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device is busy or locked
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Options for opening a device
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Open for reading
    pub read: bool,

    /// Open for writing
    pub write: bool,

    /// Create a regular file when the path does not exist
    pub create: bool,

    /// Truncate a regular file opened for writing
    pub truncate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
        }
    }
}

impl OpenOptions {
    /// Create new options with defaults (read only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set read access
    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// Set write access
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Allow creating a regular file
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Truncate a regular file to zero length on open
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

/// Information about an open device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device path
    pub path: String,

    /// Size in bytes at open time
    pub size: u64,

    /// Logical sector size
    pub block_size: u32,

    /// True for block devices, false for regular files
    pub is_block_device: bool,
}

impl DeviceInfo {
    /// Fixed capacity of the device
    ///
    /// Regular files grow as they are written, so they report no capacity.
    pub fn capacity(&self) -> Option<u64> {
        self.is_block_device.then_some(self.size)
    }
}

/// Trait for raw device I/O operations
pub trait RawDevice: Read + Write + Seek + Send {
    /// Get information about the device
    fn info(&self) -> &DeviceInfo;

    /// Get the device size in bytes
    fn size(&self) -> u64 {
        self.info().size
    }

    /// Flush all pending writes to stable storage
    fn sync(&self) -> Result<()>;
}

/// Platform operations interface
pub trait PlatformOps {
    /// Open a device or regular file for raw I/O
    fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>>;

    /// Check if running with elevated privileges
    fn has_elevated_privileges() -> bool;

    /// Bytes available to unprivileged writers on the filesystem holding `path`
    fn available_space(path: &Path) -> Result<u64>;

    /// Memory available for new allocations, in bytes
    fn available_memory() -> Result<u64>;
}

/// Directory whose filesystem will hold `path`
///
/// A file that does not exist yet lives on its parent's filesystem.
pub fn filesystem_anchor(path: &Path) -> &Path {
    if path.exists() {
        return path;
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::LinuxPlatform as Platform;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Open a device or regular file for raw I/O
        pub fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>> {
            Platform::open_device(path, options)
        }

        /// Check if running with elevated privileges
        pub fn has_elevated_privileges() -> bool {
            Platform::has_elevated_privileges()
        }

        /// Bytes available on the filesystem that holds (or will hold) `path`
        pub fn available_space(path: &Path) -> Result<u64> {
            Platform::available_space(filesystem_anchor(path))
        }

        /// Memory available for new allocations, in bytes
        pub fn available_memory() -> Result<u64> {
            Platform::available_memory()
        }
    } else {
        /// Open a device (unsupported platform)
        pub fn open_device(_path: &str, _options: OpenOptions) -> Result<Box<dyn RawDevice>> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }

        /// Check privileges (unsupported platform)
        pub fn has_elevated_privileges() -> bool {
            false
        }

        /// Free space (unsupported platform)
        pub fn available_space(_path: &Path) -> Result<u64> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }

        /// Free memory (unsupported platform)
        pub fn available_memory() -> Result<u64> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
