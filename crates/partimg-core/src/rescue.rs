//! Sector-level recovery for unreadable source blocks
//!
//! When a full-block read fails with a media error and rescue is enabled, the
//! block is re-read one sector at a time. Sectors that read back fine keep their
//! data; sectors that fail are overwritten with a recognizable placeholder so the
//! damage can be found later in the restored filesystem.
//!
//! On a random-access source each sector is read at its absolute offset. A
//! sequential source cannot go back, so the bytes the failed block read already
//! consumed are kept and only the rest of the block is re-read, starting at the
//! current stream position.

use std::io;

use crate::device::{read_full, BlockReader};
use crate::error::{is_media_error, Error, Result};

/// Sector size used for rescue reads
pub const SECTOR_SIZE: usize = 512;

/// Marker written at the start of every unreadable sector
pub const BAD_SECTOR_MARKER: &[u8] = b"BADSECTOR\0";

/// Byte used to fill the rest of an unreadable sector
pub const BAD_SECTOR_FILL: u8 = b'?';

/// Advice shown when the source has bad sectors and rescue is off
pub const BAD_SECTOR_WARNING: &str = "The source device has bad sectors. \
Copying with --rescue re-reads failed blocks sector by sector and marks \
unreadable sectors instead of aborting. Check the image or target \
filesystem afterwards, the marked data is lost.";

/// Outcome of rescuing one block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescueReport {
    /// Sectors read back successfully
    pub sectors_recovered: u64,
    /// Sectors replaced with the placeholder
    pub sectors_lost: u64,
}

/// Whether and how to retry failed source reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescuePolicy {
    enabled: bool,
    sector_size: usize,
}

impl RescuePolicy {
    /// Create a policy
    pub fn new(enabled: bool, sector_size: usize) -> Self {
        Self {
            enabled,
            sector_size: sector_size.max(1),
        }
    }

    /// Policy that never rescues
    pub fn disabled() -> Self {
        Self::new(false, SECTOR_SIZE)
    }

    /// Whether rescue is on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sector size used for retries
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Handle a failed full-block read at `block_offset`
    ///
    /// `consumed` is how many bytes of `buf` the failed read filled before the
    /// error. Returns the rescue report when the block was salvaged into `buf`,
    /// or the error that should end the run.
    pub fn recover(
        &self,
        source: &mut dyn BlockReader,
        block_offset: u64,
        buf: &mut [u8],
        consumed: usize,
        err: io::Error,
    ) -> Result<RescueReport> {
        if !is_media_error(&err) {
            return Err(Error::device_io(block_offset, err));
        }
        if !self.enabled {
            tracing::error!("Read error at offset {}: {}", block_offset, err);
            tracing::warn!("{}", BAD_SECTOR_WARNING);
            return Err(Error::device_io(block_offset, err));
        }

        tracing::warn!(
            "Read error at offset {}, rescuing in {} byte sectors",
            block_offset,
            self.sector_size
        );
        self.rescue(source, block_offset, buf, consumed)
    }

    fn rescue(
        &self,
        source: &mut dyn BlockReader,
        block_offset: u64,
        buf: &mut [u8],
        consumed: usize,
    ) -> Result<RescueReport> {
        let random = source.supports_random_access();
        let mut report = RescueReport::default();
        let mut pos = if random { 0 } else { consumed.min(buf.len()) };

        while pos < buf.len() {
            // Stop at the next sector boundary so a partly consumed sector is
            // finished before whole sectors resume
            let end = ((pos / self.sector_size + 1) * self.sector_size).min(buf.len());
            let sector = &mut buf[pos..end];
            let offset = block_offset + pos as u64;
            pos = end;

            if random {
                source
                    .seek_to(offset)
                    .map_err(|e| Error::device_io(offset, e))?;
            }

            match read_full(source, sector) {
                Ok(n) if n == sector.len() => report.sectors_recovered += 1,
                Ok(n) => {
                    return Err(Error::device_io(
                        offset + n as u64,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("source ended inside sector at offset {offset}"),
                        ),
                    ));
                }
                Err(e) if is_media_error(&e) => {
                    tracing::warn!("Bad sector at offset {}, marking as lost", offset);
                    mark_bad_sector(sector);
                    report.sectors_lost += 1;
                }
                Err(e) => return Err(Error::device_io(offset, e)),
            }
        }

        if report.sectors_lost > 0 {
            tracing::info!(
                "Block at offset {}: {} sectors recovered, {} lost",
                block_offset,
                report.sectors_recovered,
                report.sectors_lost
            );
        }

        Ok(report)
    }
}

impl Default for RescuePolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Overwrite a sector with the bad-sector placeholder
pub fn mark_bad_sector(sector: &mut [u8]) {
    sector.fill(BAD_SECTOR_FILL);
    let n = BAD_SECTOR_MARKER.len().min(sector.len());
    sector[..n].copy_from_slice(&BAD_SECTOR_MARKER[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RandomAccess, Sequential};
    use std::io::{Cursor, Read, Seek, SeekFrom};

    const EIO: i32 = 5;

    /// Seekable source whose bytes in `bad` cannot be read
    struct Flaky {
        data: Cursor<Vec<u8>>,
        bad: std::ops::Range<u64>,
    }

    impl Flaky {
        fn new(len: usize, bad: std::ops::Range<u64>) -> Self {
            Self {
                data: Cursor::new((0..len).map(|i| (i % 250) as u8).collect()),
                bad,
            }
        }
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let start = self.data.position();
            let end = start + buf.len() as u64;
            if start < self.bad.end && self.bad.start < end {
                return Err(io::Error::from_raw_os_error(EIO));
            }
            self.data.read(buf)
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    #[test]
    fn test_placeholder_layout() {
        let mut sector = [0u8; SECTOR_SIZE];
        mark_bad_sector(&mut sector);
        assert_eq!(&sector[..10], b"BADSECTOR\0");
        assert!(sector[10..].iter().all(|&b| b == b'?'));
    }

    #[test]
    fn test_placeholder_in_tiny_sector() {
        let mut sector = [0u8; 4];
        mark_bad_sector(&mut sector);
        assert_eq!(&sector, b"BADS");
    }

    #[test]
    fn test_rescue_salvages_good_sectors() {
        // Second sector of a 2048 byte block is bad
        let mut source = RandomAccess::new(Flaky::new(4096, 2560..3072));
        let mut buf = vec![0u8; 2048];
        let policy = RescuePolicy::new(true, SECTOR_SIZE);

        let report = policy
            .recover(
                &mut source,
                2048,
                &mut buf,
                0,
                io::Error::from_raw_os_error(EIO),
            )
            .unwrap();

        assert_eq!(report.sectors_recovered, 3);
        assert_eq!(report.sectors_lost, 1);
        assert_eq!(buf[0], (2048 % 250) as u8);
        assert_eq!(&buf[512..522], BAD_SECTOR_MARKER);
        assert_eq!(buf[1024], (3072 % 250) as u8);
    }

    #[test]
    fn test_disabled_policy_fails_with_bad_sector() {
        let mut source = RandomAccess::new(Flaky::new(1024, 0..512));
        let mut buf = vec![0u8; 1024];

        let err = RescuePolicy::disabled()
            .recover(&mut source, 0, &mut buf, 0, io::Error::from_raw_os_error(EIO))
            .unwrap_err();
        assert!(err.is_bad_sector());
    }

    #[test]
    fn test_non_media_error_is_not_rescued() {
        let mut source = RandomAccess::new(Flaky::new(1024, 0..0));
        let mut buf = vec![0u8; 1024];

        let err = RescuePolicy::new(true, SECTOR_SIZE)
            .recover(
                &mut source,
                0,
                &mut buf,
                0,
                io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DeviceIo { .. }));
        assert!(!err.is_bad_sector());
    }

    #[test]
    fn test_sequential_rescue_reads_in_place() {
        let mut source = Sequential::new(Cursor::new(vec![9u8; 1024]));
        let mut buf = vec![0u8; 1024];

        let report = RescuePolicy::new(true, SECTOR_SIZE)
            .recover(&mut source, 0, &mut buf, 0, io::Error::from_raw_os_error(EIO))
            .unwrap();
        assert_eq!(report.sectors_recovered, 2);
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_sequential_rescue_keeps_consumed_bytes() {
        // First sector already delivered before the error, stream now at sector 2
        let stream: Vec<u8> = [2u8, 3, 4].iter().flat_map(|&b| [b; SECTOR_SIZE]).collect();
        let mut source = Sequential::new(Cursor::new(stream));
        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        buf[..SECTOR_SIZE].fill(1);

        let report = RescuePolicy::new(true, SECTOR_SIZE)
            .recover(
                &mut source,
                0,
                &mut buf,
                SECTOR_SIZE,
                io::Error::from_raw_os_error(EIO),
            )
            .unwrap();

        assert_eq!(report.sectors_recovered, 3);
        for (index, sector) in buf.chunks(SECTOR_SIZE).enumerate() {
            assert!(sector.iter().all(|&b| b == index as u8 + 1));
        }
    }

    #[test]
    fn test_sequential_rescue_finishes_partial_sector() {
        let mut source = Sequential::new(Cursor::new(vec![7u8; 1024 - 100]));
        let mut buf = vec![0u8; 1024];
        buf[..100].fill(5);

        let report = RescuePolicy::new(true, SECTOR_SIZE)
            .recover(&mut source, 0, &mut buf, 100, io::Error::from_raw_os_error(EIO))
            .unwrap();

        assert_eq!(report.sectors_recovered, 2);
        assert!(buf[..100].iter().all(|&b| b == 5));
        assert!(buf[100..].iter().all(|&b| b == 7));
    }
}
