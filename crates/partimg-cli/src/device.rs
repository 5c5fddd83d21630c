//! Opening sources, targets and images for the engine
//!
//! Paths are opened through the platform crate so block devices report their
//! capacity and syncs reach the disk. `-` selects stdin or stdout, which the
//! engine treats as sequential streams.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use partimg_core::{BlockReader, BlockWriter, SeekCapability, Sequential};
use partimg_platform::{open_device, DeviceInfo, OpenOptions, PlatformError, RawDevice};

/// Path that selects stdin or stdout
pub const STDIO_PATH: &str = "-";

/// Buffer size for image streams (1 MB)
const IO_BUFFER_SIZE: usize = 1024 * 1024;

/// A block device or regular file opened through the platform layer
pub struct DeviceHandle {
    inner: Box<dyn RawDevice>,
    available_space: Option<u64>,
}

impl DeviceHandle {
    /// Open a device to read from
    pub fn open_source(path: &str) -> Result<Self> {
        let inner = open_device(path, OpenOptions::new())
            .with_context(|| format!("Failed to open source {}", path))?;
        Ok(Self {
            inner,
            available_space: None,
        })
    }

    /// Open a device to write to, creating a regular file if needed
    pub fn open_target(path: &str) -> Result<Self> {
        let inner = open_device(path, OpenOptions::new().write(true).create(true))
            .with_context(|| format!("Failed to open target {}", path))?;
        Ok(Self {
            inner,
            available_space: None,
        })
    }

    /// Create (or truncate) an image file and measure the room left for it
    pub fn create_image(path: &str) -> Result<Self> {
        let inner = open_device(
            path,
            OpenOptions::new()
                .read(false)
                .write(true)
                .create(true)
                .truncate(true),
        )
        .with_context(|| format!("Failed to create image {}", path))?;

        let available_space = match partimg_platform::available_space(Path::new(path)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!("Cannot measure free space for {}: {}", path, e);
                None
            }
        };

        Ok(Self {
            inner,
            available_space,
        })
    }

    /// Device information from the platform layer
    pub fn info(&self) -> &DeviceInfo {
        self.inner.info()
    }
}

impl Read for DeviceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for DeviceHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SeekCapability for DeviceHandle {
    fn supports_random_access(&self) -> bool {
        true
    }
}

impl BlockReader for DeviceHandle {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        seek_forward(&mut *self.inner, len)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.info().size)
    }
}

impl BlockWriter for DeviceHandle {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        seek_forward(&mut *self.inner, len)
    }

    fn capacity(&self) -> Option<u64> {
        self.info().capacity()
    }

    fn available_space(&self) -> Option<u64> {
        self.available_space
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.sync().map_err(into_io_error)
    }
}

fn seek_forward(inner: &mut dyn RawDevice, len: u64) -> io::Result<()> {
    let delta = i64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "skip length too large"))?;
    inner.seek(SeekFrom::Current(delta)).map(|_| ())
}

fn into_io_error(err: PlatformError) -> io::Error {
    match err {
        PlatformError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

/// Open an image for reading, `-` meaning stdin
pub fn open_image_reader(path: &str) -> Result<Box<dyn Read>> {
    if path == STDIO_PATH {
        return Ok(Box::new(BufReader::with_capacity(
            IO_BUFFER_SIZE,
            io::stdin().lock(),
        )));
    }

    let file = File::open(path).with_context(|| format!("Failed to open image {}", path))?;
    Ok(Box::new(BufReader::with_capacity(IO_BUFFER_SIZE, file)))
}

/// Open an image for writing, `-` meaning stdout
pub fn open_image_writer(path: &str) -> Result<Box<dyn BlockWriter>> {
    if path == STDIO_PATH {
        return Ok(Box::new(stdout_stream()));
    }
    Ok(Box::new(DeviceHandle::create_image(path)?))
}

/// Open a restore or duplicate target, `-` meaning stdout
pub fn open_target(path: &str) -> Result<Box<dyn BlockWriter>> {
    if path == STDIO_PATH {
        return Ok(Box::new(stdout_stream()));
    }
    Ok(Box::new(DeviceHandle::open_target(path)?))
}

fn stdout_stream() -> Sequential<BufWriter<io::Stdout>> {
    Sequential::new(BufWriter::with_capacity(IO_BUFFER_SIZE, io::stdout()))
}

/// Whether a path names a device node rather than a file or stream
pub fn is_device_path(path: &str) -> bool {
    path.starts_with("/dev/")
}
