//! Fuzz target for the multi-id delivery stream decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_batch_decode
//!
//! Feeds arbitrary chunks through `LineBuffer` and decodes every line the
//! way the delivery listener does.

#![no_main]

use libfuzzer_sys::fuzz_target;
use uprelay_core::push::{LineBuffer, decode_batch_line};

fuzz_target!(|data: &[u8]| {
    let mut lines = LineBuffer::new();
    for chunk in data.chunks(7) {
        let _ = lines.extend(chunk);
        while let Some(line) = lines.next_line() {
            let _ = decode_batch_line(&line);
        }
    }
});
