//! Listening-port discovery core library.
//!
//! Finds TCP ports being listened on by inspecting the proc filesystem
//! and attributes each to the owning process command line:
//! - Collection of connection tables, socket owners and processes
//! - Correlation with self-exclusion and dedup
//! - A never-failing discovery facade
//! - Logging, payload rendering and exit codes for the CLI
//!
//! The binary entry point is in `main.rs`.

pub mod collect;
pub mod correlate;
pub mod discovery;
pub mod exit_codes;
pub mod logging;
pub mod output;

pub use correlate::{CandidatePort, CorrelationOptions, CorrelationStats, SelfExclusionMatcher};
pub use discovery::{discover_candidate_ports, Discovery, DiscoveryReport, DiscoveryStats};

// Re-export test utilities for integration tests
#[cfg(all(unix, any(test, feature = "test-utils")))]
pub mod test_utils;
