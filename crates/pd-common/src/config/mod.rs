//! Configuration for listening-port discovery.
//!
//! This module provides:
//! - The typed `DiscoveryConfig` read from `discovery.json`
//! - Deterministic config resolution (CLI > env > XDG > defaults)
//! - Semantic validation

pub mod resolve;

pub use resolve::{ConfigPaths, ConfigResolver};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default root of the process-information pseudo-filesystem.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Default wall-clock cap on the socket listing command.
pub const DEFAULT_LISTING_TIMEOUT_MS: u64 = 5_000;

/// Default cap on captured listing output (16 MiB).
pub const DEFAULT_MAX_LISTING_BYTES: usize = 16 * 1024 * 1024;

/// Detail string used for sockets surfaced without an owning process.
pub const UNKNOWN_DETAIL: &str = "unknown";

/// Where socket ownership (inode → pid) comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerSource {
    /// External `ls -l` listing of `/proc/*/fd/*` filtered to sockets.
    /// Falls back to `FdWalk` if the command cannot run.
    #[default]
    Listing,
    /// In-process walk of every `/proc/<pid>/fd` directory.
    FdWalk,
}

impl std::fmt::Display for OwnerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerSource::Listing => write!(f, "listing"),
            OwnerSource::FdWalk => write!(f, "fd-walk"),
        }
    }
}

impl std::str::FromStr for OwnerSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "listing" | "ls" => Ok(OwnerSource::Listing),
            "fd-walk" | "fd_walk" | "fdwalk" => Ok(OwnerSource::FdWalk),
            _ => Err(format!("unknown owner source: {}", s)),
        }
    }
}

/// What to do with a listening socket that cannot be traced to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattributedPolicy {
    /// Leave it out of the result.
    #[default]
    Drop,
    /// Report it with an `"unknown"` detail and no pid.
    Surface,
}

/// Command-line patterns identifying the remote agent's own processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelfExclusion {
    /// Regex matched against the command line; hits the agent's install directory.
    pub agent_dir_pattern: Option<String>,
    /// Plain substrings naming the agent's server entry scripts.
    pub entry_scripts: Vec<String>,
}

impl Default for SelfExclusion {
    fn default() -> Self {
        SelfExclusion {
            agent_dir_pattern: Some(r"\.vscode-server(-[A-Za-z]+)?/bin/".to_string()),
            entry_scripts: vec![
                "out/server-main.js".to_string(),
                "out/vs/server/main.js".to_string(),
            ],
        }
    }
}

impl SelfExclusion {
    /// No exclusions at all.
    pub fn none() -> Self {
        SelfExclusion {
            agent_dir_pattern: None,
            entry_scripts: Vec::new(),
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Root of the process-information pseudo-filesystem.
    pub proc_root: PathBuf,
    /// Socket ownership source.
    pub owner_source: OwnerSource,
    /// Wall-clock cap on the listing command, in milliseconds.
    pub listing_timeout_ms: u64,
    /// Cap on captured listing stdout, in bytes.
    pub max_listing_bytes: usize,
    /// Run the listing command under `nice`.
    pub use_nice: bool,
    /// Policy for sockets with no resolvable owner.
    pub unattributed: UnattributedPolicy,
    /// Self-exclusion patterns.
    pub self_exclusion: SelfExclusion,
    /// Ports never reported.
    pub exclude_ports: Vec<u16>,
    /// Gather the three datasets on parallel threads.
    pub concurrent: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            owner_source: OwnerSource::default(),
            listing_timeout_ms: DEFAULT_LISTING_TIMEOUT_MS,
            max_listing_bytes: DEFAULT_MAX_LISTING_BYTES,
            use_nice: true,
            unattributed: UnattributedPolicy::default(),
            self_exclusion: SelfExclusion::default(),
            exclude_ports: Vec::new(),
            concurrent: true,
        }
    }
}

impl DiscoveryConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: DiscoveryConfig = serde_json::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Validate semantic constraints not expressible in the schema.
    pub fn validate(&self) -> Result<()> {
        if self.listing_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "listing_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_listing_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_listing_bytes must be > 0".to_string(),
            ));
        }
        if self.proc_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("proc_root must not be empty".to_string()));
        }
        if let Some(pattern) = &self.self_exclusion.agent_dir_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                Error::InvalidConfig(format!("agent_dir_pattern is not a valid regex: {}", e))
            })?;
        }
        if self.self_exclusion.entry_scripts.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidConfig(
                "entry_scripts must not contain empty strings".to_string(),
            ));
        }
        Ok(())
    }

    /// Listing timeout as a `Duration`.
    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }
}

/// Where the active config came from.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSource {
    /// Path to the config file, or None if using defaults
    pub path: Option<String>,
    /// SHA-256 hash of file contents, or None if defaults
    pub hash: Option<String>,
    /// How this source was resolved
    pub resolution: ConfigResolution,
}

/// How a config file was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigResolution {
    /// From explicit CLI flag
    CliFlag,
    /// From environment variable
    EnvVar,
    /// From XDG config directory
    XdgConfig,
    /// Using built-in defaults
    Default,
}

impl std::fmt::Display for ConfigResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigResolution::CliFlag => write!(f, "cli"),
            ConfigResolution::EnvVar => write!(f, "env"),
            ConfigResolution::XdgConfig => write!(f, "xdg"),
            ConfigResolution::Default => write!(f, "default"),
        }
    }
}
