//! Discovery facade: one call from host state to candidate ports.
//!
//! [`Discovery::discover`] never fails. Missing tables, an unusable
//! listing, vanished processes and unsupported hosts all shrink the
//! result instead of producing an error; [`DiscoveryStats`] records how
//! much was lost along the way.

use crate::collect::{
    collect_socket_owners, read_connection_tables, scan_processes, InventoryScan, OwnerScan,
    ParsedTable, ToolConfig, ToolRunner,
};
use crate::correlate::{correlate, CandidatePort, CorrelationOptions};
use crate::logging::{event_names, Stage};
use pd_common::{DiscoveryConfig, Error, OwnerSource, Result};
use serde::Serialize;
use std::path::Path;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

/// Counters describing one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub platform_supported: bool,
    pub tables_read: usize,
    pub rows_parsed: usize,
    pub rows_skipped: usize,
    pub owner_source_used: Option<OwnerSource>,
    pub owner_listing_partial: bool,
    pub sockets_owned: usize,
    pub owner_lines_skipped: usize,
    pub processes_scanned: usize,
    pub processes_dropped: usize,
    pub listening: usize,
    pub malformed_addresses: usize,
    pub excluded_ports: usize,
    pub unattributed: usize,
    pub self_excluded: usize,
    pub duplicates_collapsed: usize,
    pub candidates: usize,
    pub elapsed_ms: u64,
}

/// Candidates plus the stats that produced them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub candidates: Vec<CandidatePort>,
    pub stats: DiscoveryStats,
}

/// Whether `proc_root` looks like a usable process-information filesystem.
pub fn is_supported(proc_root: &Path) -> bool {
    proc_root.is_dir() && proc_root.join("net").is_dir()
}

/// The three raw datasets.
#[derive(Debug, Default)]
struct Gathered {
    tables: (ParsedTable, usize),
    owners: OwnerScan,
    inventory: InventoryScan,
}

/// A configured discovery engine.
///
/// Holds no host state between calls; each [`discover`](Self::discover)
/// re-reads everything.
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
    runner: ToolRunner,
    options: CorrelationOptions,
}

impl Discovery {
    /// Validate the config and prepare the listing runner and filters.
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let options = CorrelationOptions::from_config(&config)
            .map_err(|e| Error::InvalidConfig(format!("self_exclusion: {}", e)))?;
        let runner = ToolRunner::new(ToolConfig {
            default_timeout: config.listing_timeout(),
            max_output_bytes: config.max_listing_bytes,
            use_nice: config.use_nice,
            ..ToolConfig::default()
        });
        Ok(Discovery {
            config,
            runner,
            options,
        })
    }

    /// Whether this engine's proc root is usable.
    pub fn is_supported(&self) -> bool {
        is_supported(&self.config.proc_root)
    }

    /// Take one snapshot of host state and return the candidate ports.
    pub fn discover(&self) -> DiscoveryReport {
        let started = Instant::now();
        let span = info_span!("discovery", proc_root = %self.config.proc_root.display());
        let _guard = span.enter();

        info!(
            event = event_names::DISCOVERY_STARTED,
            stage = %Stage::Init,
            owner_source = %self.config.owner_source,
            concurrent = self.config.concurrent,
            "starting port discovery"
        );

        if !self.is_supported() {
            info!(
                event = event_names::DISCOVERY_UNSUPPORTED,
                stage = %Stage::Init,
                "process filesystem not available; returning no ports"
            );
            return DiscoveryReport {
                candidates: Vec::new(),
                stats: DiscoveryStats {
                    platform_supported: false,
                    elapsed_ms: elapsed_ms(started),
                    ..DiscoveryStats::default()
                },
            };
        }

        let gathered = if self.config.concurrent {
            self.gather_concurrent()
        } else {
            self.gather_sequential()
        };
        let Gathered {
            tables: (table, tables_read),
            owners,
            inventory,
        } = gathered;

        let correlation = correlate(&table.records, &owners.owners, &inventory.processes, &self.options);
        let cs = correlation.stats;
        info!(
            event = event_names::CORRELATE_FINISHED,
            stage = %Stage::Correlate,
            listening = cs.listening,
            unattributed = cs.unattributed,
            self_excluded = cs.self_excluded,
            duplicates = cs.duplicates,
            candidates = correlation.candidates.len(),
            "correlation finished"
        );

        let stats = DiscoveryStats {
            platform_supported: true,
            tables_read,
            rows_parsed: table.records.len(),
            rows_skipped: table.skipped_rows,
            owner_source_used: owners.source,
            owner_listing_partial: owners.partial,
            sockets_owned: owners.owners.len(),
            owner_lines_skipped: owners.skipped,
            processes_scanned: inventory.processes.len(),
            processes_dropped: inventory.dropped,
            listening: cs.listening,
            malformed_addresses: cs.malformed,
            excluded_ports: cs.excluded_ports,
            unattributed: cs.unattributed,
            self_excluded: cs.self_excluded,
            duplicates_collapsed: cs.duplicates,
            candidates: correlation.candidates.len(),
            elapsed_ms: elapsed_ms(started),
        };

        info!(
            event = event_names::DISCOVERY_FINISHED,
            stage = %Stage::Report,
            candidates = stats.candidates,
            elapsed_ms = stats.elapsed_ms,
            "port discovery finished"
        );

        DiscoveryReport {
            candidates: correlation.candidates,
            stats,
        }
    }

    fn collect_tables(&self) -> (ParsedTable, usize) {
        let (table, tables_read) = read_connection_tables(&self.config.proc_root);
        debug!(
            event = event_names::COLLECT_CONN_TABLE,
            stage = %Stage::ConnTable,
            tables_read,
            rows = table.records.len(),
            skipped = table.skipped_rows,
            "connection tables read"
        );
        (table, tables_read)
    }

    fn collect_owners(&self) -> OwnerScan {
        let scan = collect_socket_owners(&self.config, &self.runner);
        debug!(
            event = event_names::COLLECT_SOCKET_OWNER,
            stage = %Stage::SocketOwner,
            source = ?scan.source,
            sockets = scan.owners.len(),
            skipped = scan.skipped,
            partial = scan.partial,
            "socket owners resolved"
        );
        scan
    }

    fn collect_inventory(&self) -> InventoryScan {
        let scan = scan_processes(&self.config.proc_root);
        debug!(
            event = event_names::COLLECT_PROC_INVENTORY,
            stage = %Stage::ProcInventory,
            processes = scan.processes.len(),
            dropped = scan.dropped,
            "process inventory scanned"
        );
        scan
    }

    fn gather_sequential(&self) -> Gathered {
        Gathered {
            tables: self.collect_tables(),
            owners: self.collect_owners(),
            inventory: self.collect_inventory(),
        }
    }

    /// Run the three gathers on scoped threads. A gather that panics
    /// contributes an empty dataset.
    fn gather_concurrent(&self) -> Gathered {
        let span = tracing::Span::current();
        thread::scope(|s| {
            let tables = s.spawn(|| span.in_scope(|| self.collect_tables()));
            let owners = s.spawn(|| span.in_scope(|| self.collect_owners()));
            let inventory = s.spawn(|| span.in_scope(|| self.collect_inventory()));
            Gathered {
                tables: join_or_default(tables, Stage::ConnTable),
                owners: join_or_default(owners, Stage::SocketOwner),
                inventory: join_or_default(inventory, Stage::ProcInventory),
            }
        })
    }
}

fn join_or_default<T: Default>(handle: thread::ScopedJoinHandle<'_, T>, stage: Stage) -> T {
    handle.join().unwrap_or_else(|_| {
        warn!(
            event = event_names::COLLECT_PANICKED,
            %stage,
            "collector thread panicked; continuing without its data"
        );
        T::default()
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Find candidate ports on this host with the default configuration.
///
/// Always returns a list, possibly empty.
pub fn discover_candidate_ports() -> Vec<CandidatePort> {
    match Discovery::new(DiscoveryConfig::default()) {
        Ok(discovery) => discovery.discover().candidates,
        Err(e) => {
            warn!(error = %e, "default discovery config rejected");
            Vec::new()
        }
    }
}
