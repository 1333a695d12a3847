//! Fuzz target for correlation over structured datasets.
//!
//! Checks that the result never repeats a port, whatever the rows and
//! ownership claims look like.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pd_common::{DiscoveryConfig, ProcessId, SocketInode, UnattributedPolicy};
use pd_core::collect::{ConnectionRecord, ProcessInfo, ProcessInventory, SocketOwnerMap};
use pd_core::correlate::{correlate, CorrelationOptions};
use std::collections::HashSet;

#[derive(Debug, Arbitrary)]
struct Input {
    rows: Vec<(String, String, String)>,
    owners: Vec<(u64, u32)>,
    processes: Vec<(u32, String)>,
    surface: bool,
}

fuzz_target!(|input: Input| {
    let records: Vec<ConnectionRecord> = input
        .rows
        .iter()
        .map(|(addr, st, inode)| {
            ConnectionRecord::from_pairs([
                ("local_address", addr.as_str()),
                ("st", st.as_str()),
                ("inode", inode.as_str()),
            ])
        })
        .collect();
    let owners: SocketOwnerMap = input
        .owners
        .iter()
        .map(|(inode, pid)| (SocketInode(*inode), ProcessId(*pid)))
        .collect();
    let inventory: ProcessInventory = input
        .processes
        .iter()
        .map(|(pid, cmdline)| {
            (
                ProcessId(*pid),
                ProcessInfo {
                    pid: ProcessId(*pid),
                    cwd: "/".into(),
                    cmdline: cmdline.clone(),
                },
            )
        })
        .collect();

    let Ok(mut options) = CorrelationOptions::from_config(&DiscoveryConfig::default()) else {
        return;
    };
    if input.surface {
        options.unattributed = UnattributedPolicy::Surface;
    }

    let out = correlate(&records, &owners, &inventory, &options);
    let mut seen = HashSet::new();
    for c in &out.candidates {
        assert!(seen.insert(c.port), "duplicate port {}", c.port);
    }
});
