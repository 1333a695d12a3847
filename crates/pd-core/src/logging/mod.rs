//! Structured logging for pd-core.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - JSON lines for agents that consume the log stream
//!
//! # Usage
//!
//! ```ignore
//! use pd_core::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env(None, None);
//! init_logging(&config);
//! ```
//!
//! stdout is reserved for command payloads; all log output goes to stderr.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// A second call is a no-op, so tests and embedders may call it freely.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(format!("pd_core={}", config.level)));

    let result = match config.format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            if config.timestamps {
                tracing_subscriber::registry().with(filter).with(layer).try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => {
            let layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };

    if result.is_err() {
        tracing::debug!("logging already initialised");
    }
}

/// Shorten a possibly long value (e.g. a command line) for a log field.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...(truncated)", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("exactly10!", 10), "exactly10!");
    }

    #[test]
    fn test_truncate_long() {
        let out = truncate_for_log("/usr/bin/myserver --port 8080", 9);
        assert_eq!(out, "/usr/bin/...(truncated)");
    }

    #[test]
    fn test_truncate_multibyte() {
        let out = truncate_for_log("héllo wörld", 2);
        assert_eq!(out, "hé...(truncated)");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LogConfig::default().with_level(LogLevel::Off);
        init_logging(&config);
        init_logging(&config.clone().with_format(LogFormat::Jsonl));
    }
}
