//! Socket inode → owning process resolution.
//!
//! Every open socket shows up as a `/proc/<pid>/fd/<fd>` symlink whose
//! target is `socket:[<inode>]`. Two sources produce that mapping:
//!
//! - **Listing**: one external `ls -l` over all fd directories, piped
//!   through `grep socket:`, run under the bounded [`ToolRunner`].
//! - **Fd walk**: an in-process `read_dir`/`read_link` over the same tree.
//!
//! The listing is parsed line by line; a line that does not carry a
//! `/<pid>/fd/<fd> -> socket:[<inode>]` substring is dropped on its own.
//!
//! The pipeline's own status is `grep`'s, so the script reports `ls`'s exit
//! status on stderr. A listing whose `ls` or `grep` could not run is
//! rejected and the fd walk is used instead.

use crate::collect::tool_runner::{ToolError, ToolOutput, ToolRunner, ToolSpec};
use crate::logging::truncate_for_log;
use pd_common::{DiscoveryConfig, OwnerSource, ProcessId, SocketInode};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Prefix of the stderr line carrying `ls`'s exit status.
const LS_STATUS_MARKER: &str = "ls-exit:";

/// Why a socket listing could not be used.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("socket listing unusable: {0}")]
    Unusable(String),
}

/// Socket inode → owning process.
pub type SocketOwnerMap = HashMap<SocketInode, ProcessId>;

static LISTING_LINE: OnceLock<Regex> = OnceLock::new();

fn listing_line_regex() -> &'static Regex {
    LISTING_LINE.get_or_init(|| {
        Regex::new(r"/(\d+)/fd/\d+ -> socket:\[(\d+)\]").expect("static listing regex is valid")
    })
}

/// Result of one ownership scan.
#[derive(Debug, Clone, Default)]
pub struct OwnerScan {
    /// Resolved owners; last claim on an inode wins.
    pub owners: SocketOwnerMap,
    /// Listing lines (or fd entries) that could not be used.
    pub skipped: usize,
    /// Source that actually produced `owners`.
    pub source: Option<OwnerSource>,
    /// The listing hit its timeout and `owners` is from partial output.
    pub partial: bool,
}

/// Outcome of parsing a single listing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SocketOwnership {
    pub inode: SocketInode,
    pub pid: ProcessId,
}

/// Parse one listing line, e.g.
/// `lrwx------ 1 u u 64 Jan  1 00:00 /proc/42/fd/7 -> socket:[12345]`.
pub fn parse_listing_line(line: &str) -> Option<SocketOwnership> {
    let caps = listing_line_regex().captures(line)?;
    let pid = caps.get(1)?.as_str().parse().ok()?;
    let inode = caps.get(2)?.as_str().parse().ok()?;
    Some(SocketOwnership { inode, pid })
}

/// Parse the full listing output.
pub fn parse_socket_listing(stdout: &str) -> (SocketOwnerMap, usize) {
    let mut owners = SocketOwnerMap::new();
    let mut skipped = 0;

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_listing_line(line) {
            Some(SocketOwnership { inode, pid }) => {
                owners.insert(inode, pid);
            }
            None => {
                trace!(line, "skipping unrecognised listing line");
                skipped += 1;
            }
        }
    }

    (owners, skipped)
}

/// Extract the inode from a `socket:[N]` link target.
pub fn socket_inode_from_link(target: &str) -> Option<SocketInode> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Single-quote a path for `sh`.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Build the listing command for a proc root.
pub fn listing_spec(proc_root: &Path) -> ToolSpec {
    let script = format!(
        "{{ ls -l {}/[0-9]*/fd/[0-9]* 2>/dev/null; echo \"{}$?\" >&2; }} | grep 'socket:'",
        shell_quote(proc_root),
        LS_STATUS_MARKER
    );
    ToolSpec::new("sh", vec!["-c".to_string(), script])
}

/// `ls`'s exit status as reported on the listing's stderr.
fn reported_ls_status(stderr: &str) -> Option<i32> {
    stderr
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(LS_STATUS_MARKER))
        .and_then(|code| code.parse().ok())
}

/// Reason a finished listing cannot be trusted, if any.
///
/// `grep` exits 1 when nothing matched and `ls` exits 1 or 2 when fds
/// vanish mid-listing; both are normal. Status 126/127 means a command
/// could not be executed at all. A timed-out run is judged by its output
/// alone.
pub fn listing_failure(output: &ToolOutput) -> Option<String> {
    if output.timed_out {
        return None;
    }
    match output.exit_code {
        Some(0) | Some(1) => {}
        Some(code) => return Some(format!("pipeline exited with status {}", code)),
        None => return Some("pipeline killed by a signal".to_string()),
    }
    match reported_ls_status(&output.stderr_str()) {
        Some(code @ (126 | 127)) => Some(format!("ls could not run (status {})", code)),
        Some(_) => None,
        None => Some("ls exit status not reported".to_string()),
    }
}

/// Run the listing command and parse its output.
///
/// A timed-out run still yields whatever lines arrived before the kill.
pub fn collect_from_listing(
    runner: &ToolRunner,
    proc_root: &Path,
) -> Result<OwnerScan, ListingError> {
    let output = runner.run(&listing_spec(proc_root))?;
    if let Some(reason) = listing_failure(&output) {
        debug!(
            stderr = %truncate_for_log(&output.stderr_str(), 256),
            reason = %reason,
            "rejecting socket listing"
        );
        return Err(ListingError::Unusable(reason));
    }
    if output.timed_out {
        warn!(
            captured_bytes = output.stdout.len(),
            "socket listing timed out; using partial output"
        );
    }
    if output.truncated {
        warn!("socket listing output was truncated");
    }

    let (owners, skipped) = parse_socket_listing(&output.stdout_str());
    Ok(OwnerScan {
        owners,
        skipped,
        source: Some(OwnerSource::Listing),
        partial: output.timed_out || output.truncated,
    })
}

/// Walk `<proc_root>/<pid>/fd/*` directly.
///
/// Processes that vanish or deny access mid-walk are skipped.
pub fn collect_from_fd_walk(proc_root: &Path) -> OwnerScan {
    let mut scan = OwnerScan {
        source: Some(OwnerSource::FdWalk),
        ..OwnerScan::default()
    };

    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %proc_root.display(), error = %e, "cannot read proc root");
            return scan;
        }
    };

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<ProcessId>() else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let fds = match fs::read_dir(&fd_dir) {
            Ok(fds) => fds,
            Err(e) => {
                trace!(%pid, error = %e, "fd directory unreadable");
                scan.skipped += 1;
                continue;
            }
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode_from_link(&target.to_string_lossy()) {
                scan.owners.insert(inode, pid);
            }
        }
    }

    scan
}

/// Resolve socket owners using the configured source.
///
/// A listing that cannot be started, or whose commands fail to run, falls
/// back to the fd walk.
pub fn collect_socket_owners(config: &DiscoveryConfig, runner: &ToolRunner) -> OwnerScan {
    match config.owner_source {
        OwnerSource::FdWalk => collect_from_fd_walk(&config.proc_root),
        OwnerSource::Listing => match collect_from_listing(runner, &config.proc_root) {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "socket listing unavailable, walking fd directories");
                collect_from_fd_walk(&config.proc_root)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
lrwx------ 1 user user 64 Jan  1 00:00 /proc/42/fd/7 -> socket:[12345]
lrwx------ 1 user user 64 Jan  1 00:00 /proc/42/fd/9 -> socket:[12346]
lrwx------ 1 root root 64 Jan  1 00:00 /proc/1/fd/3 -> socket:[777]
ls: cannot access '/proc/99/fd/4': No such file or directory
lrwx------ 1 user user 64 Jan  1 00:00 /proc/43/fd/2 -> socket:[99999999999999999999999]
";

    #[test]
    fn test_parse_listing_line() {
        let own = parse_listing_line(
            "lrwx------ 1 u u 64 Jan  1 00:00 /proc/42/fd/7 -> socket:[12345]",
        )
        .unwrap();
        assert_eq!(own.pid, ProcessId(42));
        assert_eq!(own.inode, SocketInode(12345));
    }

    #[test]
    fn test_parse_listing_line_other_root() {
        let own = parse_listing_line("l 1 u u 0 x /tmp/fake123/proc/7/fd/0 -> socket:[5]").unwrap();
        assert_eq!(own.pid, ProcessId(7));
        assert_eq!(own.inode, SocketInode(5));
    }

    #[test]
    fn test_non_socket_lines_rejected() {
        assert!(parse_listing_line("/proc/42/fd/1 -> /dev/null").is_none());
        assert!(parse_listing_line("/proc/42/fd/1 -> pipe:[123]").is_none());
        assert!(parse_listing_line("/proc/self/fd/1 -> socket:[123]").is_none());
    }

    #[test]
    fn test_parse_listing_isolates_bad_lines() {
        let (owners, skipped) = parse_socket_listing(LISTING);
        assert_eq!(owners.len(), 3);
        assert_eq!(owners.get(&SocketInode(12345)), Some(&ProcessId(42)));
        assert_eq!(owners.get(&SocketInode(12346)), Some(&ProcessId(42)));
        assert_eq!(owners.get(&SocketInode(777)), Some(&ProcessId(1)));
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_last_claim_wins() {
        let listing = "/proc/10/fd/3 -> socket:[500]\n/proc/20/fd/4 -> socket:[500]\n";
        let (owners, _) = parse_socket_listing(listing);
        assert_eq!(owners.get(&SocketInode(500)), Some(&ProcessId(20)));
    }

    #[test]
    fn test_socket_inode_from_link() {
        assert_eq!(socket_inode_from_link("socket:[12345]"), Some(SocketInode(12345)));
        assert_eq!(socket_inode_from_link("socket:[]"), None);
        assert_eq!(socket_inode_from_link("pipe:[12345]"), None);
        assert_eq!(socket_inode_from_link("/dev/pts/0"), None);
    }

    #[test]
    fn test_listing_spec_quotes_root() {
        let spec = listing_spec(Path::new("/tmp/it's here"));
        assert_eq!(spec.command, "sh");
        assert_eq!(spec.args[0], "-c");
        assert!(spec.args[1].starts_with(r"{ ls -l '/tmp/it'\''s here'/[0-9]*/fd/[0-9]*"));
        assert!(spec.args[1].contains(r#"echo "ls-exit:$?" >&2; }"#));
        assert!(spec.args[1].ends_with("| grep 'socket:'"));
    }

    fn finished(exit_code: Option<i32>, stderr: &str, timed_out: bool) -> ToolOutput {
        ToolOutput {
            command: "sh".to_string(),
            args: Vec::new(),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code,
            truncated: false,
            duration: std::time::Duration::from_millis(1),
            timed_out,
        }
    }

    #[test]
    fn test_listing_failure_accepts_normal_statuses() {
        assert_eq!(listing_failure(&finished(Some(0), "ls-exit:0\n", false)), None);
        // No sockets matched, and some fds vanished while listing.
        assert_eq!(listing_failure(&finished(Some(1), "ls-exit:2\n", false)), None);
        assert_eq!(listing_failure(&finished(Some(1), "ls-exit:1\n", false)), None);
    }

    #[test]
    fn test_listing_failure_rejects_missing_ls() {
        let reason = listing_failure(&finished(Some(1), "ls-exit:127\n", false)).unwrap();
        assert!(reason.contains("127"));
        // Argument list too long.
        assert!(listing_failure(&finished(Some(1), "ls-exit:126\n", false)).is_some());
    }

    #[test]
    fn test_listing_failure_rejects_broken_pipeline() {
        assert!(listing_failure(&finished(Some(127), "ls-exit:0\n", false)).is_some());
        assert!(listing_failure(&finished(Some(2), "ls-exit:0\n", false)).is_some());
        assert!(listing_failure(&finished(None, "", false)).is_some());
        assert!(listing_failure(&finished(Some(1), "", false)).is_some());
    }

    #[test]
    fn test_listing_failure_ignores_timeout() {
        assert_eq!(listing_failure(&finished(None, "", true)), None);
    }

    #[test]
    fn test_reported_ls_status_takes_last_marker() {
        let stderr = "sh: something odd\nls-exit:0\nls-exit:2\n";
        assert_eq!(reported_ls_status(stderr), Some(2));
        assert_eq!(reported_ls_status("ls-exit:abc\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_walk_on_fake_root() {
        use crate::test_utils::FakeProcRoot;

        let root = FakeProcRoot::new();
        root.add_process(42, "/srv", &["/usr/bin/myserver"]);
        root.add_socket_fd(42, 7, 12345);
        root.add_plain_fd(42, 1, "/dev/null");
        root.add_process(43, "/", &["sleep"]);
        root.add_socket_fd(43, 3, 555);

        let scan = collect_from_fd_walk(root.path());
        assert_eq!(scan.source, Some(OwnerSource::FdWalk));
        assert_eq!(scan.owners.len(), 2);
        assert_eq!(scan.owners.get(&SocketInode(12345)), Some(&ProcessId(42)));
        assert_eq!(scan.owners.get(&SocketInode(555)), Some(&ProcessId(43)));
    }

    #[cfg(unix)]
    #[test]
    fn test_listing_on_fake_root() {
        use crate::collect::tool_runner::ToolConfig;
        use crate::test_utils::FakeProcRoot;

        let root = FakeProcRoot::new();
        root.add_process(42, "/srv", &["/usr/bin/myserver"]);
        root.add_socket_fd(42, 7, 12345);
        root.add_plain_fd(42, 1, "/dev/null");

        let runner = ToolRunner::new(ToolConfig {
            use_nice: false,
            ..ToolConfig::default()
        });
        let scan = collect_from_listing(&runner, root.path()).unwrap();
        assert_eq!(scan.source, Some(OwnerSource::Listing));
        assert_eq!(scan.owners.get(&SocketInode(12345)), Some(&ProcessId(42)));
        assert_eq!(scan.owners.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_listing_under_nice_on_fake_root() {
        use crate::collect::tool_runner::ToolConfig;
        use crate::test_utils::FakeProcRoot;

        let root = FakeProcRoot::new();
        root.add_process(42, "/srv", &["/usr/bin/myserver"]);
        root.add_socket_fd(42, 7, 12345);
        root.add_process(43, "/", &["sleep"]);
        root.add_socket_fd(43, 3, 555);

        let runner = ToolRunner::new(ToolConfig::default());
        assert!(runner.config().use_nice);
        let scan = collect_from_listing(&runner, root.path()).unwrap();
        assert_eq!(scan.source, Some(OwnerSource::Listing));
        assert!(!scan.partial);
        assert_eq!(scan.owners.get(&SocketInode(12345)), Some(&ProcessId(42)));
        assert_eq!(scan.owners.get(&SocketInode(555)), Some(&ProcessId(43)));
    }

    #[cfg(unix)]
    #[test]
    fn test_listing_on_empty_root_is_usable() {
        use crate::collect::tool_runner::ToolConfig;
        use crate::test_utils::FakeProcRoot;

        // No fd directories: the glob stays literal and ls reports an error.
        let root = FakeProcRoot::new();
        let runner = ToolRunner::new(ToolConfig {
            use_nice: false,
            ..ToolConfig::default()
        });
        let scan = collect_from_listing(&runner, root.path()).unwrap();
        assert!(scan.owners.is_empty());
    }

    #[test]
    fn test_fd_walk_missing_root() {
        let scan = collect_from_fd_walk(Path::new("/nonexistent/proc/root"));
        assert!(scan.owners.is_empty());
    }
}
