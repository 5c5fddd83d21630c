//! On-disk image container
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! +------------------------+  0
//! | header (64 bytes)      |
//! +------------------------+  64
//! | bitmap (1 byte/block)  |
//! +------------------------+  64 + total_blocks
//! | "BiTmAgIc"             |
//! +------------------------+  72 + total_blocks
//! | block data | crc tag   |  one record per used block,
//! | block data | crc tag   |  ascending block id
//! | ...                    |
//! +------------------------+
//! ```

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::Serialize;

use crate::bitmap::Bitmap;
use crate::checksum::CHECKSUM_SIZE;
use crate::error::{Error, Result};

/// Magic bytes at the start of every image
pub const IMAGE_MAGIC: &[u8; 16] = b"partimg-image\0\0\0";

/// Container format version
pub const IMAGE_VERSION: &[u8; 4] = b"0001";

/// Marker between the bitmap and the first block record
pub const BITMAP_SENTINEL: &[u8; 8] = b"BiTmAgIc";

/// Size of the encoded header in bytes
pub const HEADER_SIZE: usize = 64;

/// Width of the NUL-padded filesystem tag
pub const FS_TYPE_SIZE: usize = 16;

/// Largest block size accepted from a header (64 MB)
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Geometry and provenance of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    /// Container magic
    #[serde(skip)]
    pub magic: [u8; 16],
    /// Container format version
    pub version: String,
    /// Filesystem tag of the imaged partition
    pub fs_type: String,
    /// Bytes per block
    pub block_size: u32,
    /// Blocks in the partition
    pub total_blocks: u64,
    /// Blocks marked used in the bitmap
    pub used_blocks: u64,
    /// Size of the imaged device in bytes
    pub device_size: u64,
}

impl ImageHeader {
    /// Create a header for the current container version
    pub fn new(
        fs_type: impl Into<String>,
        block_size: u32,
        total_blocks: u64,
        used_blocks: u64,
        device_size: u64,
    ) -> Self {
        Self {
            magic: *IMAGE_MAGIC,
            version: String::from_utf8_lossy(IMAGE_VERSION).into_owned(),
            fs_type: fs_type.into(),
            block_size,
            total_blocks,
            used_blocks,
            device_size,
        }
    }

    /// Bytes covered by all blocks
    ///
    /// Saturates on geometries that [`validate`](Self::validate) rejects.
    pub fn partition_size(&self) -> u64 {
        self.total_blocks.saturating_mul(u64::from(self.block_size))
    }

    /// Bytes covered by used blocks
    pub fn used_size(&self) -> u64 {
        self.used_blocks.saturating_mul(u64::from(self.block_size))
    }

    /// Image offset of the first block record
    pub fn data_offset(&self) -> u64 {
        ((HEADER_SIZE + BITMAP_SENTINEL.len()) as u64).saturating_add(self.total_blocks)
    }

    /// Bytes occupied by one block record
    pub fn record_size(&self) -> u64 {
        u64::from(self.block_size) + CHECKSUM_SIZE as u64
    }

    /// Reject geometries no valid image can have
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::CorruptHeader("block size is zero".to_string()));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::CorruptHeader(format!(
                "block size {} exceeds maximum of {}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.total_blocks == 0 {
            return Err(Error::CorruptHeader("image has no blocks".to_string()));
        }
        if self.used_blocks > self.total_blocks {
            return Err(Error::CorruptHeader(format!(
                "{} used blocks out of {} total",
                self.used_blocks, self.total_blocks
            )));
        }
        if self.checked_image_size().is_none() {
            return Err(Error::CorruptHeader(format!(
                "{} blocks of {} bytes overflow the image size",
                self.total_blocks, self.block_size
            )));
        }
        if self.fs_type.len() > FS_TYPE_SIZE {
            return Err(Error::CorruptHeader(format!(
                "filesystem tag '{}' is longer than {} bytes",
                self.fs_type, FS_TYPE_SIZE
            )));
        }
        Ok(())
    }

    /// Projected image size, or `None` if any part of the geometry overflows
    fn checked_image_size(&self) -> Option<u64> {
        self.total_blocks.checked_mul(u64::from(self.block_size))?;
        let data_offset = ((HEADER_SIZE + BITMAP_SENTINEL.len()) as u64)
            .checked_add(self.total_blocks)?;
        self.used_blocks
            .checked_mul(self.record_size())?
            .checked_add(data_offset)
    }

    /// Encode into the fixed 64-byte layout
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.magic);

        let version = self.version.as_bytes();
        let n = version.len().min(4);
        buf[16..16 + n].copy_from_slice(&version[..n]);

        let fs = self.fs_type.as_bytes();
        let n = fs.len().min(FS_TYPE_SIZE);
        buf[20..20 + n].copy_from_slice(&fs[..n]);

        LittleEndian::write_u32(&mut buf[36..40], self.block_size);
        LittleEndian::write_u64(&mut buf[40..48], self.total_blocks);
        LittleEndian::write_u64(&mut buf[48..56], self.used_blocks);
        LittleEndian::write_u64(&mut buf[56..64], self.device_size);
        buf
    }

    /// Decode and validate a header
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..16] != IMAGE_MAGIC {
            return Err(Error::Format("not a partimg image (bad magic)".to_string()));
        }
        if &buf[16..20] != IMAGE_VERSION {
            return Err(Error::Format(format!(
                "unsupported image version '{}'",
                String::from_utf8_lossy(&buf[16..20])
            )));
        }

        let fs_raw = &buf[20..36];
        let fs_end = fs_raw.iter().position(|&b| b == 0).unwrap_or(FS_TYPE_SIZE);
        let fs_type = String::from_utf8_lossy(&fs_raw[..fs_end]).into_owned();

        let mut fields = &buf[36..];
        let block_size = fields.read_u32::<LittleEndian>().map_err(header_io)?;
        let total_blocks = fields.read_u64::<LittleEndian>().map_err(header_io)?;
        let used_blocks = fields.read_u64::<LittleEndian>().map_err(header_io)?;
        let device_size = fields.read_u64::<LittleEndian>().map_err(header_io)?;

        let header = Self::new(fs_type, block_size, total_blocks, used_blocks, device_size);
        header.validate()?;
        Ok(header)
    }
}

fn header_io(e: io::Error) -> Error {
    Error::device_io(0, e)
}

/// Read exactly `buf.len()` bytes of container structure
///
/// Running out of input mid-structure means the image is truncated, which is a
/// format problem rather than a device failure.
fn read_structure<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    offset: u64,
    what: &str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Format(format!("image truncated while reading {what}"))
        } else {
            Error::device_io(offset, e)
        }
    })
}

/// Read and validate the image header
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<ImageHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    read_structure(reader, &mut buf, 0, "header")?;
    ImageHeader::decode(&buf)
}

/// Write the image header
pub fn write_header<W: Write + ?Sized>(writer: &mut W, header: &ImageHeader) -> Result<()> {
    writer
        .write_all(&header.encode())
        .map_err(|e| Error::device_io(0, e))
}

/// Read the bitmap that follows the header
pub fn read_bitmap<R: Read + ?Sized>(reader: &mut R, header: &ImageHeader) -> Result<Bitmap> {
    let mut bitmap = Bitmap::try_new(header.total_blocks)?;
    read_structure(reader, bitmap.flags_mut(), HEADER_SIZE as u64, "bitmap")?;
    bitmap.recount()?;
    bitmap.validate(header)?;
    Ok(bitmap)
}

/// Write the bitmap
pub fn write_bitmap<W: Write + ?Sized>(writer: &mut W, bitmap: &Bitmap) -> Result<()> {
    writer
        .write_all(bitmap.as_bytes())
        .map_err(|e| Error::device_io(HEADER_SIZE as u64, e))
}

/// Read and check the sentinel that ends the bitmap
pub fn read_sentinel<R: Read + ?Sized>(reader: &mut R, header: &ImageHeader) -> Result<()> {
    let offset = HEADER_SIZE as u64 + header.total_blocks;
    let mut buf = [0u8; 8];
    read_structure(reader, &mut buf, offset, "bitmap sentinel")?;
    if &buf != BITMAP_SENTINEL {
        return Err(Error::Format(format!(
            "bad bitmap sentinel at offset {offset}"
        )));
    }
    Ok(())
}

/// Write the sentinel
pub fn write_sentinel<W: Write + ?Sized>(writer: &mut W, header: &ImageHeader) -> Result<()> {
    let offset = HEADER_SIZE as u64 + header.total_blocks;
    writer
        .write_all(BITMAP_SENTINEL)
        .map_err(|e| Error::device_io(offset, e))
}

/// Write header, bitmap and sentinel in order
pub fn write_preamble<W: Write + ?Sized>(
    writer: &mut W,
    header: &ImageHeader,
    bitmap: &Bitmap,
) -> Result<()> {
    write_header(writer, header)?;
    write_bitmap(writer, bitmap)?;
    write_sentinel(writer, header)
}

/// Read the record of `block_id` into `data`, returning its checksum tag
///
/// `offset` is the record's position in the image, used for error context.
pub fn read_block_record<R: Read + ?Sized>(
    reader: &mut R,
    data: &mut [u8],
    block_id: u64,
    offset: u64,
) -> Result<[u8; CHECKSUM_SIZE]> {
    let what = format!("block {block_id}");
    let mut tag = [0u8; CHECKSUM_SIZE];
    read_structure(reader, data, offset, &what)?;
    read_structure(reader, &mut tag, offset + data.len() as u64, &what)?;
    Ok(tag)
}

/// Append one block record
pub fn write_block_record<W: Write + ?Sized>(
    writer: &mut W,
    data: &[u8],
    tag: [u8; CHECKSUM_SIZE],
    offset: u64,
) -> Result<()> {
    writer
        .write_all(data)
        .and_then(|_| writer.write_all(&tag))
        .map_err(|e| Error::device_io(offset, e))
}

/// Exact size of a complete image for `header`
///
/// Saturates on geometries that [`ImageHeader::validate`] rejects.
pub fn projected_image_size(header: &ImageHeader) -> u64 {
    header
        .used_blocks
        .saturating_mul(header.record_size())
        .saturating_add(header.data_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> ImageHeader {
        ImageHeader::new("ext4", 4096, 1000, 3, 4_096_000)
    }

    #[test]
    fn test_header_layout() {
        let buf = sample_header().encode();
        assert_eq!(&buf[0..16], IMAGE_MAGIC);
        assert_eq!(&buf[16..20], b"0001");
        assert_eq!(&buf[20..24], b"ext4");
        assert!(buf[24..36].iter().all(|&b| b == 0));
        assert_eq!(LittleEndian::read_u32(&buf[36..40]), 4096);
        assert_eq!(LittleEndian::read_u64(&buf[40..48]), 1000);
        assert_eq!(LittleEndian::read_u64(&buf[48..56]), 3);
        assert_eq!(LittleEndian::read_u64(&buf[56..64]), 4_096_000);
    }

    #[test]
    fn test_header_decode_restores_fields() {
        let header = sample_header();
        let decoded = ImageHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut buf = sample_header().encode();
        buf[0] = b'X';
        assert!(matches!(ImageHeader::decode(&buf), Err(Error::Format(_))));
    }

    #[test]
    fn test_unknown_version_is_format_error() {
        let mut buf = sample_header().encode();
        buf[16..20].copy_from_slice(b"0002");
        let err = ImageHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("0002"));
    }

    #[test]
    fn test_impossible_geometry_is_corrupt() {
        let cases = [
            ImageHeader::new("ext4", 0, 10, 1, 0),
            ImageHeader::new("ext4", 4096, 0, 0, 0),
            ImageHeader::new("ext4", 4096, 10, 11, 40960),
            ImageHeader::new("ext4", MAX_BLOCK_SIZE + 1, 10, 1, 0),
        ];
        for header in cases {
            let err = ImageHeader::decode(&header.encode()).unwrap_err();
            assert!(
                matches!(err, Error::CorruptHeader(_)),
                "expected corrupt header for {header:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_long_fs_tag_rejected() {
        let header = ImageHeader::new("a-very-long-filesystem-name", 4096, 1, 1, 4096);
        assert!(matches!(header.validate(), Err(Error::CorruptHeader(_))));
    }

    #[test]
    fn test_truncated_header() {
        let mut reader = Cursor::new(vec![0u8; 10]);
        let err = read_header(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_preamble_then_read_back() {
        let header = ImageHeader::new("RAW", 512, 6, 2, 3072);
        let bitmap = Bitmap::from_flags(vec![0, 1, 0, 0, 1, 0]).unwrap();

        let mut out = Vec::new();
        write_preamble(&mut out, &header, &bitmap).unwrap();
        assert_eq!(out.len() as u64, header.data_offset());
        assert_eq!(&out[HEADER_SIZE + 6..], BITMAP_SENTINEL);

        let mut reader = Cursor::new(out);
        let read = read_header(&mut reader).unwrap();
        let flags = read_bitmap(&mut reader, &read).unwrap();
        read_sentinel(&mut reader, &read).unwrap();
        assert_eq!(flags, bitmap);
    }

    #[test]
    fn test_bitmap_count_must_match_header() {
        let header = ImageHeader::new("RAW", 512, 4, 3, 2048);
        let mut reader = Cursor::new(vec![1u8, 0, 0, 1]);
        let err = read_bitmap(&mut reader, &header).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader(_)));
    }

    #[test]
    fn test_bad_sentinel() {
        let header = ImageHeader::new("RAW", 512, 4, 0, 2048);
        let mut reader = Cursor::new(b"BiTmAgIx".to_vec());
        let err = read_sentinel(&mut reader, &header).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("offset 68"));
    }

    #[test]
    fn test_block_record() {
        let mut out = Vec::new();
        write_block_record(&mut out, &[7u8; 16], [1, 2, 3, 4], 0).unwrap();
        assert_eq!(out.len(), 20);

        let mut data = [0u8; 16];
        let tag = read_block_record(&mut Cursor::new(out), &mut data, 0, 0).unwrap();
        assert_eq!(data, [7u8; 16]);
        assert_eq!(tag, [1, 2, 3, 4]);
    }

    #[test]
    fn test_short_block_record_is_truncation() {
        let mut data = [0u8; 16];
        let err =
            read_block_record(&mut Cursor::new(vec![0u8; 18]), &mut data, 7, 100).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("block 7"));
    }

    #[test]
    fn test_overflowing_geometry_is_corrupt() {
        let cases = [
            ImageHeader::new("ext4", 4096, 1 << 60, 0, 0),
            ImageHeader::new("ext4", 512, u64::MAX - 4, 0, 0),
            ImageHeader::new("ext4", 1, u64::MAX, 0, 0),
            ImageHeader::new("ext4", MAX_BLOCK_SIZE, 1 << 40, 1 << 40, 0),
        ];
        for header in cases {
            let err = ImageHeader::decode(&header.encode()).unwrap_err();
            assert!(
                matches!(err, Error::CorruptHeader(_)),
                "expected corrupt header for {header:?}, got {err:?}"
            );
            assert_eq!(header.partition_size(), u64::MAX);
        }
    }

    #[test]
    fn test_largest_geometry_accepted() {
        let header = ImageHeader::new("RAW", 1, u64::MAX - 72, 0, 0);
        header.validate().unwrap();
        assert_eq!(header.data_offset(), u64::MAX);
        assert_eq!(projected_image_size(&header), u64::MAX);
    }

    #[test]
    fn test_projected_size() {
        let header = ImageHeader::new("RAW", 4096, 1000, 3, 4_096_000);
        assert_eq!(
            projected_image_size(&header),
            3 * (4096 + 4) + HEADER_SIZE as u64 + 1000 + 8
        );
    }

    #[test]
    fn test_header_json_omits_magic() {
        let json = serde_json::to_value(sample_header()).unwrap();
        assert!(json.get("magic").is_none());
        assert_eq!(json["fs_type"], "ext4");
        assert_eq!(json["used_blocks"], 3);
    }
}
