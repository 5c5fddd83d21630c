//! Fuzz test for image header decoding
//!
//! Tests that header decoding handles arbitrary bytes safely and that every
//! header it accepts satisfies the geometry invariants.

#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg_core::container::{ImageHeader, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    let Ok(buf) = <[u8; HEADER_SIZE]>::try_from(data.get(..HEADER_SIZE).unwrap_or(&[])) else {
        return;
    };

    if let Ok(header) = ImageHeader::decode(&buf) {
        assert!(header.block_size > 0);
        assert!(header.total_blocks > 0);
        assert!(header.used_blocks <= header.total_blocks);

        // Accepted headers must encode back to the same bytes, minus tag padding garbage
        let encoded = header.encode();
        assert_eq!(&encoded[36..], &buf[36..]);
    }
});
