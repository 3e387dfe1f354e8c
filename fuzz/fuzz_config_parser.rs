//! Fuzz target for relay configuration parsing and validation.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = uprelay_config::AppConfig::parse(s) {
            // Anything that validated must yield usable durations and URLs.
            let _ = config.distributor.endpoint_base();
            let _ = config.server.record_ttl();
            let _ = config.listener.backoff_max();
        }
    }
});
