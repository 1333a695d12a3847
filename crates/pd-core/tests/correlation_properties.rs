//! Property-based tests for parser and correlation invariants.

use pd_common::{DiscoveryConfig, ProcessId, SocketInode, UnattributedPolicy};
use pd_core::collect::{
    parse_connection_table, ConnectionRecord, ProcessInfo, ProcessInventory, SocketOwnerMap,
};
use pd_core::correlate::{correlate, CorrelationOptions};
use proptest::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;

const AGENT_CMDLINE: &str = "/home/u/.vscode-server/bin/abc/node /home/u/.vscode-server/bin/abc/out/server-main.js";
/// Pid present in owner mappings but absent from the inventory.
const VANISHED_PID: u32 = 8;

#[derive(Debug, Clone)]
struct Row {
    port: u16,
    listening: bool,
    inode: u64,
    owner: Option<u32>,
}

fn row_strategy() -> impl Strategy<Value = Row> {
    (
        prop_oneof![1u16..16, any::<u16>()],
        any::<bool>(),
        1u64..64,
        prop::option::of(1u32..=VANISHED_PID),
    )
        .prop_map(|(port, listening, inode, owner)| Row {
            port,
            listening,
            inode,
            owner,
        })
}

fn is_agent(pid: u32) -> bool {
    pid % 3 == 0
}

/// Build the three datasets. When rows share an inode the last owner wins,
/// mirroring the socket listing's last-claim rule.
fn build(rows: &[Row]) -> (Vec<ConnectionRecord>, SocketOwnerMap, ProcessInventory) {
    let records = rows
        .iter()
        .map(|r| {
            ConnectionRecord::from_pairs([
                ("local_address", format!("0100007F:{:04X}", r.port)),
                ("st", if r.listening { "0A" } else { "01" }.to_string()),
                ("inode", r.inode.to_string()),
            ])
        })
        .collect();

    let mut owners = SocketOwnerMap::new();
    for r in rows {
        if let Some(pid) = r.owner {
            owners.insert(SocketInode(r.inode), ProcessId(pid));
        }
    }

    let inventory = (1..VANISHED_PID)
        .map(|pid| {
            let cmdline = if is_agent(pid) {
                AGENT_CMDLINE.to_string()
            } else {
                format!("/usr/bin/svc-{}", pid)
            };
            (
                ProcessId(pid),
                ProcessInfo {
                    pid: ProcessId(pid),
                    cwd: PathBuf::from("/"),
                    cmdline,
                },
            )
        })
        .collect();

    (records, owners, inventory)
}

fn default_options() -> CorrelationOptions {
    CorrelationOptions::from_config(&DiscoveryConfig::default()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn ports_are_unique_and_sorted(rows in prop::collection::vec(row_strategy(), 0..40)) {
        let (records, owners, inventory) = build(&rows);
        for policy in [UnattributedPolicy::Drop, UnattributedPolicy::Surface] {
            let mut options = default_options();
            options.unattributed = policy;
            let out = correlate(&records, &owners, &inventory, &options);
            let ports: Vec<u16> = out.candidates.iter().map(|c| c.port).collect();
            let mut sorted = ports.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(ports, sorted);
        }
    }

    #[test]
    fn unowned_sockets_never_reported(rows in prop::collection::vec(row_strategy(), 0..40)) {
        let (records, owners, inventory) = build(&rows);
        let out = correlate(&records, &owners, &inventory, &default_options());
        for c in &out.candidates {
            let pid = c.pid.expect("dropped policy only yields attributed candidates");
            prop_assert!(inventory.contains_key(&pid));
            prop_assert!(owners.values().any(|p| *p == pid));
        }
        prop_assert!(out.candidates.iter().all(|c| c.detail != "unknown"));
    }

    #[test]
    fn agent_processes_never_reported(rows in prop::collection::vec(row_strategy(), 0..40)) {
        let (records, owners, inventory) = build(&rows);
        for policy in [UnattributedPolicy::Drop, UnattributedPolicy::Surface] {
            let mut options = default_options();
            options.unattributed = policy;
            let out = correlate(&records, &owners, &inventory, &options);
            for c in &out.candidates {
                prop_assert!(!c.detail.contains(".vscode-server"));
                if let Some(pid) = c.pid {
                    prop_assert!(!is_agent(pid.0));
                }
            }
        }
    }

    #[test]
    fn only_listening_ports_reported(rows in prop::collection::vec(row_strategy(), 0..40)) {
        let (records, owners, inventory) = build(&rows);
        let mut options = default_options();
        options.unattributed = UnattributedPolicy::Surface;
        let out = correlate(&records, &owners, &inventory, &options);
        let listening: HashSet<u16> = rows.iter().filter(|r| r.listening).map(|r| r.port).collect();
        for c in &out.candidates {
            prop_assert!(listening.contains(&c.port));
        }
        prop_assert_eq!(out.stats.listening, rows.iter().filter(|r| r.listening).count());
    }

    #[test]
    fn short_rows_do_not_disturb_siblings(
        good in prop::collection::vec((any::<u16>(), 1u64..1_000_000), 0..20),
        bad_positions in prop::collection::vec(any::<prop::sample::Index>(), 0..5),
        bad_width in 0usize..10,
    ) {
        let header = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";
        let mut lines: Vec<String> = good
            .iter()
            .enumerate()
            .map(|(i, (port, inode))| format!(
                "{}: 0100007F:{:04X} 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0",
                i, port, inode
            ))
            .collect();
        let bad_row = (0..bad_width).map(|i| format!("x{}", i)).collect::<Vec<_>>().join(" ");
        for idx in &bad_positions {
            let at = idx.index(lines.len() + 1);
            lines.insert(at, bad_row.clone());
        }
        let text = std::iter::once(header.to_string()).chain(lines).collect::<Vec<_>>().join("\n");

        let table = parse_connection_table(&text);
        let blank_bad = bad_row.trim().is_empty();
        prop_assert_eq!(table.records.len(), good.len());
        prop_assert_eq!(table.skipped_rows, if blank_bad { 0 } else { bad_positions.len() });
        for (record, (port, inode)) in table.records.iter().zip(&good) {
            prop_assert_eq!(record.local_address().map(|a| a.port), Some(*port));
            prop_assert_eq!(record.inode(), Some(SocketInode(*inode)));
            prop_assert!(record.is_listening());
        }
    }
}
