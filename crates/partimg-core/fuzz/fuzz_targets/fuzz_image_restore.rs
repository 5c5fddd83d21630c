//! Fuzz test for checking arbitrary image streams
//!
//! Tests that the engine rejects malformed images with an error instead of
//! panicking or allocating without bound.

#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg_core::Engine;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Cap memory so hostile headers fail the resource check
    let mut engine = Engine::new().available_memory(Some(64 * 1024 * 1024));
    let _ = engine.check(&mut Cursor::new(data));
});
