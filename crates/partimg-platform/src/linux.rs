//! Linux platform implementation
//!
//! Block devices are sized with `BLKGETSIZE64` and report their logical
//! sector size through `BLKSSZGET`. Regular files are accepted too so images
//! can be made from and restored to plain files.

use crate::{DeviceInfo, OpenOptions, PlatformError, PlatformOps, RawDevice, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions as StdOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Default logical sector size when the kernel does not report one
const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Linux platform implementation
pub struct LinuxPlatform;

impl PlatformOps for LinuxPlatform {
    fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>> {
        LinuxDevice::open(path, options).map(|d| Box::new(d) as Box<dyn RawDevice>)
    }

    fn has_elevated_privileges() -> bool {
        // SAFETY: geteuid() is a simple syscall that returns the effective user ID.
        // It has no preconditions and cannot cause undefined behavior.
        #[allow(unsafe_code)]
        unsafe {
            libc::geteuid() == 0
        }
    }

    fn available_space(path: &Path) -> Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            PlatformError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path contains a NUL byte: {}", path.display()),
            ))
        })?;

        // SAFETY: statvfs is plain old data; an all-zero value is valid and is
        // overwritten by the call below.
        #[allow(unsafe_code)]
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };

        // SAFETY: c_path is a valid NUL-terminated string and stat is a valid,
        // writable statvfs for the duration of the call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

        if result != 0 {
            return Err(PlatformError::Io(std::io::Error::last_os_error()));
        }

        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn available_memory() -> Result<u64> {
        let contents = std::fs::read_to_string("/proc/meminfo")?;
        parse_meminfo(&contents).ok_or_else(|| {
            PlatformError::NotSupported("/proc/meminfo has no memory figure".to_string())
        })
    }
}

/// Linux device wrapper for raw I/O
pub struct LinuxDevice {
    file: File,
    info: DeviceInfo,
}

impl LinuxDevice {
    /// Open a block device or regular file
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let device_path = Path::new(path);

        if !device_path.exists() && !options.create {
            return Err(PlatformError::DeviceNotFound(path.to_string()));
        }

        let file = StdOpenOptions::new()
            .read(options.read)
            .write(options.write)
            .create(options.write && options.create)
            .truncate(options.write && options.truncate)
            .open(device_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    PlatformError::PermissionDenied(format!(
                        "Cannot open {}: {}. Try running with sudo.",
                        path, e
                    ))
                } else if e.raw_os_error() == Some(libc::EBUSY) {
                    PlatformError::DeviceBusy(format!("{} is busy. Try unmounting first.", path))
                } else {
                    PlatformError::Io(e)
                }
            })?;

        let metadata = file.metadata()?;
        let is_block_device = metadata.file_type().is_block_device();
        if is_block_device && options.truncate {
            tracing::debug!("Ignoring truncate for block device {}", path);
        }

        let (size, block_size) = if is_block_device {
            (get_device_size(&file, path)?, get_sector_size(&file))
        } else {
            (metadata.len(), DEFAULT_SECTOR_SIZE)
        };

        tracing::debug!(
            "Opened {} ({} bytes, {} byte sectors, block device: {})",
            path,
            size,
            block_size,
            is_block_device
        );

        Ok(Self {
            file,
            info: DeviceInfo {
                path: path.to_string(),
                size,
                block_size,
                is_block_device,
            },
        })
    }
}

impl RawDevice for LinuxDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn sync(&self) -> Result<()> {
        let fd = self.file.as_raw_fd();
        // SAFETY: fsync() is called with a valid file descriptor obtained from as_raw_fd().
        // The fd remains valid for the lifetime of self.file.
        #[allow(unsafe_code)]
        let result = unsafe { libc::fsync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(PlatformError::Io(std::io::Error::last_os_error()))
        }
    }
}

impl Read for LinuxDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LinuxDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LinuxDevice {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Get block device size using ioctl
fn get_device_size(file: &File, path: &str) -> Result<u64> {
    let fd = file.as_raw_fd();

    // Cast via u32 to handle the sign bit correctly on platforms where Ioctl is i32
    const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

    let mut size: u64 = 0;
    // SAFETY: ioctl with BLKGETSIZE64 writes a u64 to the provided pointer.
    // We pass a valid mutable reference to a u64, and fd is valid.
    #[allow(unsafe_code)]
    let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };

    if result == 0 {
        return Ok(size);
    }

    // Fallback: seek to end
    // SAFETY: lseek64 is called with a valid fd. We save/restore the current position
    // to avoid side effects. The fd remains valid throughout these calls.
    #[allow(unsafe_code)]
    let size = unsafe {
        let current = libc::lseek64(fd, 0, libc::SEEK_CUR);
        let end = libc::lseek64(fd, 0, libc::SEEK_END);
        libc::lseek64(fd, current, libc::SEEK_SET);
        end
    };

    if size < 0 {
        Err(PlatformError::Io(std::io::Error::other(format!(
            "Failed to get size of {path}"
        ))))
    } else {
        Ok(size as u64)
    }
}

/// Get block device logical sector size
fn get_sector_size(file: &File) -> u32 {
    const BLKSSZGET: libc::Ioctl = 0x1268u32 as libc::Ioctl;

    let mut sector_size: i32 = 0;
    // SAFETY: ioctl with BLKSSZGET writes an i32 to the provided pointer.
    // We pass a valid mutable reference to an i32, and fd is valid.
    #[allow(unsafe_code)]
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut sector_size) };

    if result == 0 && sector_size > 0 {
        sector_size as u32
    } else {
        DEFAULT_SECTOR_SIZE
    }
}

/// Extract available memory in bytes from `/proc/meminfo` contents
///
/// Prefers `MemAvailable`; kernels older than 3.14 only have `MemFree`.
fn parse_meminfo(contents: &str) -> Option<u64> {
    let field = |name: &str| {
        contents.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some(kib * 1024)
        })
    };
    field("MemAvailable").or_else(|| field("MemFree"))
}

// ============================================================================
// UNIT TESTS
// ============================================================================
