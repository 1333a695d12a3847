//! Configuration resolution for port discovery.
//!
//! Implements deterministic config resolution order:
//! 1. Explicit CLI flag (--config)
//! 2. Environment variable (PD_CONFIG)
//! 3. $XDG_CONFIG_HOME/port_discovery/discovery.json
//! 4. ~/.config/port_discovery/discovery.json
//! 5. Built-in defaults

use std::env;
use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::{ConfigResolution, ConfigSource, DiscoveryConfig};
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PD_CONFIG";

/// Directory name under the XDG config home.
pub const CONFIG_DIR_NAME: &str = "port_discovery";

/// Config file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "discovery.json";

/// Configuration file paths from the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit path to discovery.json
    pub config_path: Option<PathBuf>,
}

/// Configuration resolver with deterministic resolution order.
#[derive(Debug)]
pub struct ConfigResolver {
    cli_paths: ConfigPaths,
}

impl ConfigResolver {
    /// Create a new resolver with CLI paths.
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigResolver { cli_paths: paths }
    }

    /// Create a resolver with no CLI overrides.
    pub fn with_defaults() -> Self {
        ConfigResolver {
            cli_paths: ConfigPaths::default(),
        }
    }

    /// Resolve the config directory used for the XDG step.
    pub fn resolve_config_dir(&self) -> Option<PathBuf> {
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg).join(CONFIG_DIR_NAME));
            }
        }
        dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME))
    }

    /// Resolve the discovery.json path.
    ///
    /// CLI and env paths are returned even if missing so that loading
    /// reports the typo instead of silently falling back to defaults.
    pub fn resolve_config_path(&self) -> (Option<PathBuf>, ConfigResolution) {
        if let Some(ref path) = self.cli_paths.config_path {
            return (Some(path.clone()), ConfigResolution::CliFlag);
        }

        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return (Some(PathBuf::from(path)), ConfigResolution::EnvVar);
            }
        }

        if let Some(config_dir) = self.resolve_config_dir() {
            let path = config_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                return (Some(path), ConfigResolution::XdgConfig);
            }
        }

        (None, ConfigResolution::Default)
    }

    /// Load the config from the resolved path or defaults.
    pub fn load(&self) -> Result<(DiscoveryConfig, ConfigSource)> {
        let (path, resolution) = self.resolve_config_path();

        match path {
            Some(p) => {
                let content = fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("failed to read config from {}: {}", p.display(), e))
                })?;

                let hash = compute_sha256(&content);

                let config = DiscoveryConfig::from_json_str(&content).map_err(|e| match e {
                    Error::InvalidConfig(msg) => {
                        Error::InvalidConfig(format!("{}: {}", p.display(), msg))
                    }
                    other => other,
                })?;

                Ok((
                    config,
                    ConfigSource {
                        path: Some(p.to_string_lossy().to_string()),
                        hash: Some(hash),
                        resolution,
                    },
                ))
            }
            None => Ok((
                DiscoveryConfig::default(),
                ConfigSource {
                    path: None,
                    hash: None,
                    resolution: ConfigResolution::Default,
                },
            )),
        }
    }
}

/// Compute SHA-256 hash of a string.
fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
