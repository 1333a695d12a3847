//! Fuzz target for socket listing parsing.
//!
//! Tests that listing output handles arbitrary input without panicking and
//! that each non-blank line is either used or counted as skipped.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pd_core::collect::parse_socket_listing;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let (owners, skipped) = parse_socket_listing(&text);
    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    assert!(owners.len() + skipped <= lines);
});
