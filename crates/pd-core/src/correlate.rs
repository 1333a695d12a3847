//! Port correlation: connection rows → socket owners → processes.
//!
//! Joins the three collected datasets into [`CandidatePort`]s. Only
//! listening rows are considered; each is traced through its socket inode
//! to an owning pid and from there to the process command line.
//!
//! Filters, in order:
//! 1. non-listening rows and rows with an undecodable `local_address`
//! 2. ports in the configured exclusion list
//! 3. sockets with no owner or no inventory entry (per [`UnattributedPolicy`])
//! 4. processes belonging to the remote agent itself (self-exclusion)
//!
//! The result holds at most one candidate per port, sorted by port.

use crate::collect::{ConnectionRecord, ProcessInventory, SocketOwnerMap};
use pd_common::config::UNKNOWN_DETAIL;
use pd_common::{DiscoveryConfig, ProcessId, SelfExclusion, UnattributedPolicy};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::trace;

/// One discovered listening port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePort {
    /// Local port number.
    pub port: u16,
    /// Owning process command line, or `"unknown"`.
    pub detail: String,
    /// Bound local address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,
    /// Owning process, when attributed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessId>,
}

impl CandidatePort {
    /// Whether the port was traced to a process.
    pub fn is_attributed(&self) -> bool {
        self.pid.is_some()
    }
}

/// Compiled self-exclusion patterns.
#[derive(Debug, Clone)]
pub struct SelfExclusionMatcher {
    agent_dir: Option<Regex>,
    entry_scripts: Vec<String>,
}

impl SelfExclusionMatcher {
    pub fn from_config(config: &SelfExclusion) -> Result<Self, regex::Error> {
        let agent_dir = config
            .agent_dir_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(SelfExclusionMatcher {
            agent_dir,
            entry_scripts: config.entry_scripts.clone(),
        })
    }

    /// Whether a command line belongs to the agent's own processes.
    pub fn is_self(&self, cmdline: &str) -> bool {
        if let Some(re) = &self.agent_dir {
            if re.is_match(cmdline) {
                return true;
            }
        }
        self.entry_scripts
            .iter()
            .any(|script| cmdline.contains(script.as_str()))
    }
}

/// Correlation settings derived from [`DiscoveryConfig`].
#[derive(Debug, Clone)]
pub struct CorrelationOptions {
    pub unattributed: UnattributedPolicy,
    pub self_exclusion: SelfExclusionMatcher,
    pub exclude_ports: BTreeSet<u16>,
}

impl CorrelationOptions {
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, regex::Error> {
        Ok(CorrelationOptions {
            unattributed: config.unattributed,
            self_exclusion: SelfExclusionMatcher::from_config(&config.self_exclusion)?,
            exclude_ports: config.exclude_ports.iter().copied().collect(),
        })
    }
}

/// Counters for one correlation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
    /// Rows in listening state.
    pub listening: usize,
    /// Listening rows whose `local_address` could not be decoded.
    pub malformed: usize,
    /// Listening rows on an excluded port.
    pub excluded_ports: usize,
    /// Listening rows with no owner or no inventory entry.
    pub unattributed: usize,
    /// Listening rows owned by the agent itself.
    pub self_excluded: usize,
    /// Candidates replaced by a later row on the same port.
    pub duplicates: usize,
}

/// Output of [`correlate`].
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub candidates: Vec<CandidatePort>,
    pub stats: CorrelationStats,
}

/// Join the collected datasets into candidate ports.
///
/// When two rows share a port the later row wins, except that an
/// unattributed candidate never displaces an attributed one.
pub fn correlate(
    records: &[ConnectionRecord],
    owners: &SocketOwnerMap,
    inventory: &ProcessInventory,
    options: &CorrelationOptions,
) -> Correlation {
    let mut stats = CorrelationStats::default();
    let mut by_port: BTreeMap<u16, CandidatePort> = BTreeMap::new();

    for record in records.iter().filter(|r| r.is_listening()) {
        stats.listening += 1;

        let Some(addr) = record.local_address() else {
            trace!(fields = ?record.fields(), "listening row without usable local_address");
            stats.malformed += 1;
            continue;
        };

        if options.exclude_ports.contains(&addr.port) {
            stats.excluded_ports += 1;
            continue;
        }

        let process = record
            .inode()
            .filter(|inode| !inode.is_null())
            .and_then(|inode| owners.get(&inode))
            .and_then(|pid| inventory.get(pid));

        let candidate = match process {
            Some(info) => {
                if options.self_exclusion.is_self(&info.cmdline) {
                    trace!(port = addr.port, pid = %info.pid, "excluding agent-owned port");
                    stats.self_excluded += 1;
                    continue;
                }
                CandidatePort {
                    port: addr.port,
                    detail: info.cmdline.clone(),
                    host: Some(addr.ip),
                    pid: Some(info.pid),
                }
            }
            None => {
                stats.unattributed += 1;
                match options.unattributed {
                    UnattributedPolicy::Drop => {
                        trace!(port = addr.port, inode = ?record.inode(), "dropping unattributed port");
                        continue;
                    }
                    UnattributedPolicy::Surface => CandidatePort {
                        port: addr.port,
                        detail: UNKNOWN_DETAIL.to_string(),
                        host: Some(addr.ip),
                        pid: None,
                    },
                }
            }
        };

        match by_port.get(&candidate.port) {
            Some(existing) => {
                stats.duplicates += 1;
                if candidate.is_attributed() || !existing.is_attributed() {
                    by_port.insert(candidate.port, candidate);
                }
            }
            None => {
                by_port.insert(candidate.port, candidate);
            }
        }
    }

    Correlation {
        candidates: by_port.into_values().collect(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{parse_connection_table, parse_socket_listing, ProcessInfo};
    use pd_common::SocketInode;
    use std::path::PathBuf;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    fn row(local: &str, state: &str, inode: u64) -> String {
        format!(
            "   0: {} 00000000:0000 {} 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0",
            local, state, inode
        )
    }

    fn table(rows: &[String]) -> Vec<ConnectionRecord> {
        let text = std::iter::once(HEADER.to_string())
            .chain(rows.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n");
        parse_connection_table(&text).records
    }

    fn inventory(entries: &[(u32, &str)]) -> ProcessInventory {
        entries
            .iter()
            .map(|(pid, cmdline)| {
                (
                    ProcessId(*pid),
                    ProcessInfo {
                        pid: ProcessId(*pid),
                        cwd: PathBuf::from("/"),
                        cmdline: cmdline.to_string(),
                    },
                )
            })
            .collect()
    }

    fn owners(pairs: &[(u64, u32)]) -> SocketOwnerMap {
        pairs
            .iter()
            .map(|(inode, pid)| (SocketInode(*inode), ProcessId(*pid)))
            .collect()
    }

    fn defaults() -> CorrelationOptions {
        CorrelationOptions::from_config(&DiscoveryConfig::default()).unwrap()
    }

    #[test]
    fn test_attributed_listener() {
        let records = table(&[row("0100007F:1F90", "0A", 12345)]);
        let (owners, _) =
            parse_socket_listing("lrwx------ 1 u u 64 Jan  1 00:00 /proc/42/fd/7 -> socket:[12345]\n");
        let inventory = inventory(&[(42, "/usr/bin/myserver --port 8080")]);

        let out = correlate(&records, &owners, &inventory, &defaults());
        assert_eq!(
            out.candidates,
            vec![CandidatePort {
                port: 8080,
                detail: "/usr/bin/myserver --port 8080".to_string(),
                host: Some("127.0.0.1".parse().unwrap()),
                pid: Some(ProcessId(42)),
            }]
        );
        assert_eq!(out.stats.listening, 1);
    }

    #[test]
    fn test_agent_entry_script_excluded() {
        let records = table(&[row("0100007F:1F90", "0A", 12345)]);
        let owners = owners(&[(12345, 42)]);
        let inventory = inventory(&[(
            42,
            "/home/u/.vscode-server/bin/abc123/node /home/u/.vscode-server/bin/abc123/out/server-main.js --port 0",
        )]);

        let out = correlate(&records, &owners, &inventory, &defaults());
        assert!(out.candidates.is_empty());
        assert_eq!(out.stats.self_excluded, 1);
    }

    #[test]
    fn test_self_exclusion_patterns() {
        let matcher = SelfExclusionMatcher::from_config(&SelfExclusion::default()).unwrap();
        assert!(matcher.is_self("/root/.vscode-server-insiders/bin/x/node"));
        assert!(matcher.is_self("/root/.vscode-server/bin/x/node"));
        assert!(matcher.is_self("node /opt/app/out/vs/server/main.js"));
        assert!(!matcher.is_self("/usr/bin/myserver --port 8080"));
        assert!(!matcher.is_self("/root/.vscode-server/data/extension-host"));

        let disabled = SelfExclusionMatcher::from_config(&SelfExclusion {
            agent_dir_pattern: None,
            entry_scripts: Vec::new(),
        })
        .unwrap();
        assert!(!disabled.is_self("/root/.vscode-server/bin/x/out/server-main.js"));
    }

    #[test]
    fn test_unowned_inode_dropped() {
        let records = table(&[row("00000000:1F90", "0A", 999)]);
        let out = correlate(&records, &owners(&[(12345, 42)]), &inventory(&[(42, "x")]), &defaults());
        assert!(out.candidates.is_empty());
        assert_eq!(out.stats.unattributed, 1);
    }

    #[test]
    fn test_owner_without_inventory_dropped() {
        let records = table(&[row("00000000:1F90", "0A", 12345)]);
        let out = correlate(&records, &owners(&[(12345, 42)]), &ProcessInventory::new(), &defaults());
        assert!(out.candidates.is_empty());
        assert_eq!(out.stats.unattributed, 1);
    }

    #[test]
    fn test_unowned_inode_surfaced_as_unknown() {
        let records = table(&[row("00000000:1F90", "0A", 999)]);
        let mut options = defaults();
        options.unattributed = UnattributedPolicy::Surface;

        let out = correlate(&records, &SocketOwnerMap::new(), &ProcessInventory::new(), &options);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].port, 8080);
        assert_eq!(out.candidates[0].detail, "unknown");
        assert_eq!(out.candidates[0].pid, None);
    }

    #[test]
    fn test_same_port_collapses_to_one() {
        let records = table(&[
            row("0100007F:1F90", "0A", 100),
            row("00000000:1F90", "0A", 200),
        ]);
        let owners = owners(&[(100, 1), (200, 2)]);
        let inventory = inventory(&[(1, "first"), (2, "second")]);

        let out = correlate(&records, &owners, &inventory, &defaults());
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].port, 8080);
        assert_eq!(out.candidates[0].detail, "second");
        assert_eq!(out.stats.duplicates, 1);
    }

    #[test]
    fn test_unknown_never_displaces_attributed() {
        let records = table(&[
            row("0100007F:1F90", "0A", 100),
            row("00000000000000000000000000000000:1F90", "0A", 999),
        ]);
        let mut options = defaults();
        options.unattributed = UnattributedPolicy::Surface;

        let out = correlate(&records, &owners(&[(100, 1)]), &inventory(&[(1, "server")]), &options);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].detail, "server");
    }

    #[test]
    fn test_non_listening_ignored() {
        let records = table(&[
            row("0100007F:1F90", "01", 100),
            row("0100007F:0050", "06", 101),
        ]);
        let out = correlate(&records, &owners(&[(100, 1), (101, 1)]), &inventory(&[(1, "x")]), &defaults());
        assert!(out.candidates.is_empty());
        assert_eq!(out.stats.listening, 0);
    }

    #[test]
    fn test_excluded_ports_and_malformed() {
        let records = table(&[
            row("0100007F:0016", "0A", 100),
            row("ZZZZ:1F90", "0A", 101),
            row("0100007F:0BB8", "0A", 102),
        ]);
        let mut options = defaults();
        options.exclude_ports.insert(22);

        let out = correlate(
            &records,
            &owners(&[(100, 1), (101, 1), (102, 1)]),
            &inventory(&[(1, "svc")]),
            &options,
        );
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].port, 3000);
        assert_eq!(out.stats.excluded_ports, 1);
        assert_eq!(out.stats.malformed, 1);
    }

    #[test]
    fn test_sorted_by_port() {
        let records = table(&[
            row("0100007F:2328", "0A", 3),
            row("0100007F:0050", "0A", 1),
            row("0100007F:1F90", "0A", 2),
        ]);
        let out = correlate(
            &records,
            &owners(&[(1, 9), (2, 9), (3, 9)]),
            &inventory(&[(9, "svc")]),
            &defaults(),
        );
        let ports: Vec<u16> = out.candidates.iter().map(|c| c.port).collect();
        assert_eq!(ports, vec![80, 8080, 9000]);
    }

    #[test]
    fn test_candidate_serialization() {
        let unknown = CandidatePort {
            port: 8080,
            detail: "unknown".to_string(),
            host: None,
            pid: None,
        };
        assert_eq!(
            serde_json::to_string(&unknown).unwrap(),
            r#"{"port":8080,"detail":"unknown"}"#
        );

        let known = CandidatePort {
            port: 3000,
            detail: "node app.js".to_string(),
            host: Some("::".parse().unwrap()),
            pid: Some(ProcessId(7)),
        };
        assert_eq!(
            serde_json::to_string(&known).unwrap(),
            r#"{"port":3000,"detail":"node app.js","host":"::","pid":7}"#
        );
    }
}
