//! Port discovery common types, IDs, errors, and configuration.
//!
//! This crate provides foundational types shared across pd-core modules:
//! - Validated key types for the inode → pid → process joins
//! - Common error types
//! - Output formats
//! - Configuration loading and validation

pub mod config;
pub mod error;
pub mod id;
pub mod output;

pub use config::{
    ConfigPaths, ConfigResolution, ConfigResolver, ConfigSource, DiscoveryConfig, OwnerSource,
    SelfExclusion, UnattributedPolicy,
};
pub use error::{Error, Result};
pub use id::{KeyParseError, ProcessId, SocketInode};
pub use output::OutputFormat;
