//! Payload rendering for the `ports` command.
//!
//! Every format writes to a `String` so the CLI owns the single stdout
//! write; logs never share this channel.

use crate::correlate::CandidatePort;
use crate::discovery::{DiscoveryReport, DiscoveryStats};
use pd_common::OutputFormat;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Serialize)]
struct WithStats<'a> {
    candidates: &'a [CandidatePort],
    stats: &'a DiscoveryStats,
}

#[derive(Serialize)]
struct StatsLine<'a> {
    stats: &'a DiscoveryStats,
}

/// Render a report. With `include_stats` the JSON forms carry a `stats`
/// object and the text forms a stats footer.
pub fn render(
    report: &DiscoveryReport,
    format: OutputFormat,
    include_stats: bool,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Json => render_json(report, include_stats),
        OutputFormat::Jsonl => render_jsonl(report, include_stats),
        OutputFormat::Md => Ok(render_markdown(report, include_stats)),
        OutputFormat::Summary => Ok(render_summary(report, include_stats)),
    }
}

/// A bare array of candidates, or `{candidates, stats}`.
pub fn render_json(report: &DiscoveryReport, include_stats: bool) -> Result<String, serde_json::Error> {
    let mut out = if include_stats {
        serde_json::to_string_pretty(&WithStats {
            candidates: &report.candidates,
            stats: &report.stats,
        })?
    } else {
        serde_json::to_string_pretty(&report.candidates)?
    };
    out.push('\n');
    Ok(out)
}

/// One candidate per line, then an optional `{"stats": ...}` line.
pub fn render_jsonl(report: &DiscoveryReport, include_stats: bool) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for candidate in &report.candidates {
        out.push_str(&serde_json::to_string(candidate)?);
        out.push('\n');
    }
    if include_stats {
        out.push_str(&serde_json::to_string(&StatsLine {
            stats: &report.stats,
        })?);
        out.push('\n');
    }
    Ok(out)
}

/// Markdown table of candidates.
pub fn render_markdown(report: &DiscoveryReport, include_stats: bool) -> String {
    let mut out = String::from("# Listening ports\n\n");

    if report.candidates.is_empty() {
        out.push_str("_No candidate ports found._\n");
    } else {
        out.push_str("| Port | PID | Host | Detail |\n");
        out.push_str("|-----:|----:|------|--------|\n");
        for c in &report.candidates {
            let pid = c.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
            let host = c.host.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "| {} | {} | {} | `{}` |",
                c.port,
                pid,
                host,
                escape_md_cell(&c.detail)
            );
        }
    }

    if include_stats {
        let s = &report.stats;
        out.push_str("\n## Stats\n\n");
        let _ = writeln!(out, "- platform supported: {}", s.platform_supported);
        let _ = writeln!(
            out,
            "- rows: {} parsed, {} skipped ({} tables)",
            s.rows_parsed, s.rows_skipped, s.tables_read
        );
        let _ = writeln!(
            out,
            "- owners: {} sockets via {}{}",
            s.sockets_owned,
            s.owner_source_used
                .map(|src| src.to_string())
                .unwrap_or_else(|| "none".to_string()),
            if s.owner_listing_partial { " (partial)" } else { "" }
        );
        let _ = writeln!(
            out,
            "- processes: {} scanned, {} dropped",
            s.processes_scanned, s.processes_dropped
        );
        let _ = writeln!(
            out,
            "- listening: {}, unattributed: {}, self-excluded: {}, duplicates: {}",
            s.listening, s.unattributed, s.self_excluded, s.duplicates_collapsed
        );
        let _ = writeln!(out, "- elapsed: {} ms", s.elapsed_ms);
    }

    out
}

/// One line suitable for status bars.
pub fn render_summary(report: &DiscoveryReport, include_stats: bool) -> String {
    let mut out = match report.candidates.len() {
        0 => "no candidate ports".to_string(),
        n => {
            let ports: Vec<String> = report.candidates.iter().map(|c| c.port.to_string()).collect();
            format!(
                "{} candidate port{}: {}",
                n,
                if n == 1 { "" } else { "s" },
                ports.join(", ")
            )
        }
    };
    if include_stats {
        let s = &report.stats;
        let _ = write!(
            out,
            " (listening={} unattributed={} self_excluded={} elapsed_ms={})",
            s.listening, s.unattributed, s.self_excluded, s.elapsed_ms
        );
    }
    out.push('\n');
    out
}

fn escape_md_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('`', "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_common::ProcessId;

    fn report() -> DiscoveryReport {
        DiscoveryReport {
            candidates: vec![
                CandidatePort {
                    port: 3000,
                    detail: "unknown".to_string(),
                    host: None,
                    pid: None,
                },
                CandidatePort {
                    port: 8080,
                    detail: "/usr/bin/myserver --port 8080 | tee".to_string(),
                    host: Some("127.0.0.1".parse().unwrap()),
                    pid: Some(ProcessId(42)),
                },
            ],
            stats: DiscoveryStats {
                platform_supported: true,
                listening: 3,
                unattributed: 1,
                ..DiscoveryStats::default()
            },
        }
    }

    #[test]
    fn test_json_is_bare_array() {
        let out = render(&report(), OutputFormat::Json, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[1]["port"], 8080);
        assert_eq!(arr[1]["pid"], 42);
        assert!(arr[0].get("pid").is_none());
    }

    #[test]
    fn test_json_with_stats() {
        let out = render(&report(), OutputFormat::Json, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["candidates"].as_array().unwrap().len(), 2);
        assert_eq!(value["stats"]["listening"], 3);
        assert_eq!(value["stats"]["platform_supported"], true);
    }

    #[test]
    fn test_jsonl_lines() {
        let out = render(&report(), OutputFormat::Jsonl, true).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: CandidatePort = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.port, 3000);
        assert!(lines[2].starts_with(r#"{"stats":"#));
    }

    #[test]
    fn test_markdown_escapes_pipes() {
        let out = render(&report(), OutputFormat::Md, false).unwrap();
        assert!(out.contains("| 8080 | 42 | 127.0.0.1 |"));
        assert!(out.contains(r"--port 8080 \| tee"));
        assert!(out.contains("| 3000 | - | - | `unknown` |"));
        assert!(!out.contains("## Stats"));
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            render(&report(), OutputFormat::Summary, false).unwrap(),
            "2 candidate ports: 3000, 8080\n"
        );
        let empty = DiscoveryReport::default();
        assert_eq!(render_summary(&empty, false), "no candidate ports\n");
        assert!(render_summary(&report(), true).contains("unattributed=1"));
    }
}
