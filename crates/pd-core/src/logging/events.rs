//! Stage and event-name vocabulary for structured logs.
//!
//! Every stage summary is emitted with an `event` field from
//! [`event_names`] and a `stage` field from [`Stage`], so JSONL consumers
//! can filter without parsing messages.

use serde::{Deserialize, Serialize};

/// Pipeline stages of one discovery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Config resolution and platform gate.
    Init,
    /// Kernel connection table read.
    ConnTable,
    /// Socket inode → pid resolution.
    SocketOwner,
    /// Process directory scan.
    ProcInventory,
    /// Join, filter and dedup.
    Correlate,
    /// Payload rendering.
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ConnTable => "conn_table",
            Stage::SocketOwner => "socket_owner",
            Stage::ProcInventory => "proc_inventory",
            Stage::Correlate => "correlate",
            Stage::Report => "report",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard event names used in logging.
pub mod event_names {
    pub const DISCOVERY_STARTED: &str = "discovery.started";
    pub const DISCOVERY_UNSUPPORTED: &str = "discovery.unsupported";
    pub const DISCOVERY_FINISHED: &str = "discovery.finished";

    pub const COLLECT_CONN_TABLE: &str = "collect.conn_table";
    pub const COLLECT_SOCKET_OWNER: &str = "collect.socket_owner";
    pub const COLLECT_PROC_INVENTORY: &str = "collect.proc_inventory";
    pub const COLLECT_PANICKED: &str = "collect.panicked";

    pub const CORRELATE_FINISHED: &str = "correlate.finished";

    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";

    pub const COMMAND_FAILED: &str = "command.failed";
}
