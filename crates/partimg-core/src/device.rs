//! Block-level source and target handles
//!
//! The engine never touches files directly. Sources implement [`BlockReader`],
//! targets implement [`BlockWriter`], and both advertise whether they can seek.
//! [`RandomAccess`] wraps anything seekable (files, block devices, cursors) and
//! [`Sequential`] wraps pipes and sockets that can only move forward.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Size of the zero buffer used to pad sequential targets (64 KB)
const ZERO_CHUNK: usize = 64 * 1024;

static ZEROES: [u8; ZERO_CHUNK] = [0u8; ZERO_CHUNK];

/// Whether a handle can be repositioned
pub trait SeekCapability {
    /// True for handles that support absolute seeks
    fn supports_random_access(&self) -> bool;
}

/// Source of block data
pub trait BlockReader: Read + SeekCapability {
    /// Position the handle at an absolute byte offset
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;

    /// Move forward `len` bytes without using the data
    fn skip(&mut self, len: u64) -> io::Result<()>;

    /// Total size of the source, when it is known
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Destination of block data or image bytes
pub trait BlockWriter: Write + SeekCapability {
    /// Position the handle at an absolute byte offset
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;

    /// Move forward `len` bytes, leaving (or writing) zeroes behind
    fn skip(&mut self, len: u64) -> io::Result<()>;

    /// Usable size of the target, when it is known
    fn capacity(&self) -> Option<u64> {
        None
    }

    /// Free space on the filesystem holding the target, when it is known
    fn available_space(&self) -> Option<u64> {
        None
    }

    /// Flush buffered data and push it to stable storage
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Read until `buf` is full or the reader is exhausted
///
/// Returns the number of bytes read, which is short only at end of input.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total_read = 0;

    while total_read < buf.len() {
        match reader.read(&mut buf[total_read..]) {
            Ok(0) => break, // EOF
            Ok(n) => total_read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(total_read)
}

// ----------------------------------------------------------------------------
// Random access
// ----------------------------------------------------------------------------

/// Seekable handle
#[derive(Debug)]
pub struct RandomAccess<T> {
    inner: T,
    capacity: Option<u64>,
    available_space: Option<u64>,
}

impl<T> RandomAccess<T> {
    /// Wrap a seekable handle
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            capacity: None,
            available_space: None,
        }
    }

    /// Report a known size
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Report free space on the backing filesystem
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space = Some(bytes);
        self
    }

    /// Borrow the wrapped handle
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the wrapped handle
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap the handle
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Read for RandomAccess<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Write> Write for RandomAccess<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T> SeekCapability for RandomAccess<T> {
    fn supports_random_access(&self) -> bool {
        true
    }
}

impl<T: Read + Seek> BlockReader for RandomAccess<T> {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        seek_forward(&mut self.inner, len)
    }

    fn size_hint(&self) -> Option<u64> {
        self.capacity
    }
}

impl<T: Write + Seek> BlockWriter for RandomAccess<T> {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        seek_forward(&mut self.inner, len)
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    fn available_space(&self) -> Option<u64> {
        self.available_space
    }
}

fn seek_forward<S: Seek>(inner: &mut S, len: u64) -> io::Result<()> {
    let delta = i64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "skip length too large"))?;
    inner.seek(SeekFrom::Current(delta)).map(|_| ())
}

// ----------------------------------------------------------------------------
// Sequential
// ----------------------------------------------------------------------------

/// Forward-only handle over a pipe or stream
///
/// Skipping a reader consumes and discards bytes; skipping a writer emits
/// zeroes. Seeking forward is a skip, seeking backward is an error.
#[derive(Debug)]
pub struct Sequential<T> {
    inner: T,
    position: u64,
    capacity: Option<u64>,
    available_space: Option<u64>,
}

impl<T> Sequential<T> {
    /// Wrap a forward-only handle
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            position: 0,
            capacity: None,
            available_space: None,
        }
    }

    /// Report a known size
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Report free space on the backing filesystem
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space = Some(bytes);
        self
    }

    /// Bytes moved through the handle so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Unwrap the handle
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn forward_distance(&self, offset: u64) -> io::Result<u64> {
        offset.checked_sub(self.position).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "cannot seek back to offset {} on a sequential stream at {}",
                    offset, self.position
                ),
            )
        })
    }
}

impl<T: Read> Read for Sequential<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<T: Write> Write for Sequential<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T> SeekCapability for Sequential<T> {
    fn supports_random_access(&self) -> bool {
        false
    }
}

impl<T: Read> BlockReader for Sequential<T> {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let distance = self.forward_distance(offset)?;
        BlockReader::skip(self, distance)
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        self.position += copied;
        if copied < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after skipping {copied} of {len} bytes"),
            ));
        }
        Ok(())
    }

    fn size_hint(&self) -> Option<u64> {
        self.capacity
    }
}

impl<T: Write> BlockWriter for Sequential<T> {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let distance = self.forward_distance(offset)?;
        BlockWriter::skip(self, distance)
    }

    fn skip(&mut self, mut len: u64) -> io::Result<()> {
        while len > 0 {
            let n = len.min(ZERO_CHUNK as u64) as usize;
            self.write_all(&ZEROES[..n])?;
            len -= n as u64;
        }
        Ok(())
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    fn available_space(&self) -> Option<u64> {
        self.available_space
    }
}

// ----------------------------------------------------------------------------
// Null target
// ----------------------------------------------------------------------------

/// Target that accepts and discards everything
///
/// Used to verify an image without restoring it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTarget;

impl Write for NullTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SeekCapability for NullTarget {
    fn supports_random_access(&self) -> bool {
        true
    }
}

impl BlockWriter for NullTarget {
    fn seek_to(&mut self, _offset: u64) -> io::Result<()> {
        Ok(())
    }

    fn skip(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }
}
