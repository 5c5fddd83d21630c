//! Per-block used/unused classification and the filesystem plugin interface
//!
//! A [`Bitmap`] holds one byte per block (`1` = used, `0` = unused). It is produced
//! once per run, either by a [`BitmapProvider`] reading a live partition or by
//! deserializing an existing image, and is read-only during traversal.

use crate::container::ImageHeader;
use crate::device::BlockReader;
use crate::error::{Error, Result};

/// Flag value for a block that holds filesystem data
pub const BLOCK_USED: u8 = 1;

/// Flag value for a block the filesystem does not use
pub const BLOCK_FREE: u8 = 0;

/// Default block size for the raw provider (4 KB)
pub const DEFAULT_RAW_BLOCK_SIZE: u32 = 4096;

/// Used/unused flag for every block of a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    flags: Vec<u8>,
    used: u64,
}

impl Bitmap {
    /// Allocate a bitmap with every block marked free
    ///
    /// The allocation is fallible: a partition too large to track in memory is
    /// reported as [`Error::Resource`] instead of aborting the process.
    pub fn try_new(total_blocks: u64) -> Result<Self> {
        let len = usize::try_from(total_blocks).map_err(|_| {
            Error::Resource(format!(
                "bitmap for {total_blocks} blocks exceeds addressable memory"
            ))
        })?;

        let mut flags = Vec::new();
        flags.try_reserve_exact(len).map_err(|e| {
            Error::Resource(format!(
                "cannot allocate {total_blocks} byte bitmap: {e}"
            ))
        })?;
        flags.resize(len, BLOCK_FREE);

        Ok(Self { flags, used: 0 })
    }

    /// Build a bitmap from raw flag bytes
    pub fn from_flags(flags: Vec<u8>) -> Result<Self> {
        let mut bitmap = Self { flags, used: 0 };
        bitmap.recount()?;
        Ok(bitmap)
    }

    /// Mark a block as used
    ///
    /// # Panics
    /// Panics if `block_id` is out of range.
    pub fn set_used(&mut self, block_id: u64) {
        let flag = &mut self.flags[block_id as usize];
        if *flag != BLOCK_USED {
            *flag = BLOCK_USED;
            self.used += 1;
        }
    }

    /// Mark every block as used
    pub fn fill_used(&mut self) {
        self.flags.fill(BLOCK_USED);
        self.used = self.flags.len() as u64;
    }

    /// Whether a block is used; out-of-range ids are unused
    pub fn is_used(&self, block_id: u64) -> bool {
        usize::try_from(block_id)
            .ok()
            .and_then(|i| self.flags.get(i))
            .is_some_and(|&f| f == BLOCK_USED)
    }

    /// Number of blocks covered
    pub fn total_blocks(&self) -> u64 {
        self.flags.len() as u64
    }

    /// Number of used blocks
    pub fn used_blocks(&self) -> u64 {
        self.used
    }

    /// Ids of used blocks in ascending order
    pub fn used_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f == BLOCK_USED)
            .map(|(i, _)| i as u64)
    }

    /// Flag bytes as persisted in an image
    pub fn as_bytes(&self) -> &[u8] {
        &self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut [u8] {
        &mut self.flags
    }

    /// Recompute the used count, rejecting bytes that are not valid flags
    pub(crate) fn recount(&mut self) -> Result<()> {
        let mut used = 0u64;
        for (id, &flag) in self.flags.iter().enumerate() {
            match flag {
                BLOCK_USED => used += 1,
                BLOCK_FREE => {}
                other => {
                    return Err(Error::CorruptHeader(format!(
                        "invalid bitmap flag {other:#04x} for block {id}"
                    )))
                }
            }
        }
        self.used = used;
        Ok(())
    }

    /// Check that this bitmap matches the geometry in `header`
    pub fn validate(&self, header: &ImageHeader) -> Result<()> {
        if self.total_blocks() != header.total_blocks {
            return Err(Error::CorruptHeader(format!(
                "bitmap covers {} blocks but header declares {}",
                self.total_blocks(),
                header.total_blocks
            )));
        }
        if self.used != header.used_blocks {
            return Err(Error::CorruptHeader(format!(
                "bitmap marks {} blocks used but header declares {}",
                self.used, header.used_blocks
            )));
        }
        Ok(())
    }
}

/// Filesystem plugin that knows which blocks of a partition are in use
///
/// Implementations read whatever metadata they need from `source` (superblock,
/// allocation tables) and report the filesystem's native block size,
/// `total_blocks = device_size / block_size`, and one flag per block.
pub trait BitmapProvider {
    /// Filesystem tag stored in the image header
    fn fs_type(&self) -> &str;

    /// Derive the header and bitmap for the partition behind `source`
    fn extract(&mut self, source: &mut dyn BlockReader) -> Result<(ImageHeader, Bitmap)>;
}

/// Provider that treats every block of the source as used
///
/// Works for any filesystem (or none) at the cost of copying free space too.
#[derive(Debug, Clone)]
pub struct RawProvider {
    block_size: u32,
    device_size: Option<u64>,
}

impl RawProvider {
    /// Filesystem tag written by this provider
    pub const FS_TYPE: &'static str = "RAW";

    /// Create a raw provider with the given block size
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            device_size: None,
        }
    }

    /// Override the device size instead of asking the source
    pub fn device_size(mut self, size: u64) -> Self {
        self.device_size = Some(size);
        self
    }
}

impl Default for RawProvider {
    fn default() -> Self {
        Self::new(DEFAULT_RAW_BLOCK_SIZE)
    }
}

impl BitmapProvider for RawProvider {
    fn fs_type(&self) -> &str {
        Self::FS_TYPE
    }

    fn extract(&mut self, source: &mut dyn BlockReader) -> Result<(ImageHeader, Bitmap)> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block size must be non-zero".to_string()));
        }

        let device_size = self.device_size.or_else(|| source.size_hint()).ok_or_else(|| {
            Error::InvalidConfig("raw imaging needs the size of the source device".to_string())
        })?;

        let total_blocks = device_size / u64::from(self.block_size);
        if total_blocks == 0 {
            return Err(Error::CorruptHeader(format!(
                "source of {device_size} bytes is smaller than one {} byte block",
                self.block_size
            )));
        }

        let mut bitmap = Bitmap::try_new(total_blocks)?;
        bitmap.fill_used();

        tracing::debug!(
            "Raw bitmap: {} blocks of {} bytes",
            total_blocks,
            self.block_size
        );

        let header = ImageHeader::new(
            Self::FS_TYPE,
            self.block_size,
            total_blocks,
            total_blocks,
            device_size,
        );
        Ok((header, bitmap))
    }
}
