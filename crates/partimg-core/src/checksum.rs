//! Running CRC-32 used to tag and verify image data
//!
//! The accumulator is the raw CRC-32 register (zip/ethernet polynomial, seeded with
//! all ones, no final inversion). It is folded across every used block in ascending
//! block order and never reset, so each stored tag covers all data before it.

use crate::error::{Error, Result};

/// Initial accumulator value
pub const CHECKSUM_SEED: u32 = 0xFFFF_FFFF;

/// Size of a persisted checksum tag in bytes
pub const CHECKSUM_SIZE: usize = 4;

/// Fold `bytes` into the accumulator `acc`
///
/// `crc32fast` works on finalized values, so the register is inverted on the way
/// in and out.
pub fn fold(acc: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!acc);
    hasher.update(bytes);
    !hasher.finalize()
}

/// Persisted form of an accumulator value
pub fn snapshot(acc: u32) -> [u8; CHECKSUM_SIZE] {
    acc.to_le_bytes()
}

/// Accumulator value from its persisted form
pub fn from_snapshot(tag: [u8; CHECKSUM_SIZE]) -> u32 {
    u32::from_le_bytes(tag)
}

/// Streaming checksum owned by one engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningChecksum {
    value: u32,
    blocks: u64,
}

impl RunningChecksum {
    /// Create a freshly seeded accumulator
    pub fn new() -> Self {
        Self {
            value: CHECKSUM_SEED,
            blocks: 0,
        }
    }

    /// Fold one block of data and return the new accumulator value
    pub fn fold(&mut self, data: &[u8]) -> u32 {
        self.value = fold(self.value, data);
        self.blocks += 1;
        self.value
    }

    /// Current accumulator value
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Number of blocks folded so far
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Current value in persisted form
    pub fn snapshot(&self) -> [u8; CHECKSUM_SIZE] {
        snapshot(self.value)
    }

    /// Compare a stored tag against the current value
    pub fn verify(&self, block: u64, tag: [u8; CHECKSUM_SIZE]) -> Result<()> {
        let expected = from_snapshot(tag);
        if expected == self.value {
            Ok(())
        } else {
            Err(Error::Integrity {
                block,
                expected,
                actual: self.value,
            })
        }
    }
}

impl Default for RunningChecksum {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_matches_standard_crc32() {
        // Standard CRC-32 of "123456789" is 0xCBF43926; the raw register is its complement
        let acc = fold(CHECKSUM_SEED, b"123456789");
        assert_eq!(acc, !0xCBF4_3926);
        assert_eq!(acc, 0x340B_C6D9);
    }

    #[test]
    fn test_fold_empty_is_identity() {
        assert_eq!(fold(CHECKSUM_SEED, &[]), CHECKSUM_SEED);
        assert_eq!(fold(0x1234_5678, &[]), 0x1234_5678);
    }

    #[test]
    fn test_fold_is_streaming() {
        let data: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        let whole = fold(CHECKSUM_SEED, &data);
        let split = fold(fold(CHECKSUM_SEED, &data[..3000]), &data[3000..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_fold_is_order_dependent() {
        let a = vec![0x11u8; 512];
        let b = vec![0x22u8; 512];
        let ab = fold(fold(CHECKSUM_SEED, &a), &b);
        let ba = fold(fold(CHECKSUM_SEED, &b), &a);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_snapshot_is_little_endian() {
        assert_eq!(snapshot(0x0403_0201), [1, 2, 3, 4]);
        assert_eq!(from_snapshot([1, 2, 3, 4]), 0x0403_0201);
    }

    #[test]
    fn test_running_checksum_tracks_blocks() {
        let mut running = RunningChecksum::new();
        assert_eq!(running.value(), CHECKSUM_SEED);
        assert_eq!(running.blocks(), 0);

        let v1 = running.fold(&[0xAB; 4096]);
        let v2 = running.fold(&[0xCD; 4096]);
        assert_ne!(v1, v2);
        assert_eq!(running.value(), v2);
        assert_eq!(running.blocks(), 2);
    }

    #[test]
    fn test_writer_and_reader_agree() {
        let blocks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 1024]).collect();

        let mut writer = RunningChecksum::new();
        let tags: Vec<[u8; 4]> = blocks
            .iter()
            .map(|b| {
                writer.fold(b);
                writer.snapshot()
            })
            .collect();

        let mut reader = RunningChecksum::new();
        for (id, (block, tag)) in blocks.iter().zip(tags).enumerate() {
            reader.fold(block);
            reader.verify(id as u64, tag).unwrap();
        }
    }

    #[test]
    fn test_verify_reports_both_values() {
        let mut running = RunningChecksum::new();
        running.fold(b"data");
        let err = running.verify(7, [0, 0, 0, 0]).unwrap_err();
        match err {
            Error::Integrity {
                block,
                expected,
                actual,
            } => {
                assert_eq!(block, 7);
                assert_eq!(expected, 0);
                assert_eq!(actual, running.value());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
