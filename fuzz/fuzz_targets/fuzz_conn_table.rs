//! Fuzz target for connection table parsing.
//!
//! Arbitrary table text must never panic, including in the per-column
//! accessors used by correlation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pd_core::collect::parse_connection_table;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let table = parse_connection_table(&text);
    for record in &table.records {
        let _ = record.local_address();
        let _ = record.state();
        let _ = record.inode();
    }
});
