//! Process inventory from the proc filesystem.
//!
//! Reads `<proc_root>/<pid>/cwd` and `<proc_root>/<pid>/cmdline` for every
//! numeric directory. Processes come and go during the scan; any process
//! whose details cannot be read is left out rather than failing the scan.

use pd_common::ProcessId;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// One live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    /// Process ID.
    pub pid: ProcessId,
    /// Working directory (target of the `cwd` link).
    pub cwd: PathBuf,
    /// Command line with argument separators rendered as spaces.
    pub cmdline: String,
}

/// Process ID → process details.
pub type ProcessInventory = HashMap<ProcessId, ProcessInfo>;

/// Result of one inventory scan.
#[derive(Debug, Clone, Default)]
pub struct InventoryScan {
    /// Processes whose details were read.
    pub processes: ProcessInventory,
    /// Numeric entries seen but dropped (exited, permission denied).
    pub dropped: usize,
}

/// Render a raw `cmdline` buffer for display.
///
/// Arguments are NUL-separated with a trailing NUL; the trailing
/// terminator is removed and the separators become spaces.
pub fn format_cmdline(raw: &[u8]) -> String {
    let trimmed = match raw.iter().rposition(|&b| b != 0) {
        Some(last) => &raw[..=last],
        None => return String::new(),
    };
    String::from_utf8_lossy(trimmed).replace('\0', " ")
}

/// Read one process's details.
pub fn read_process(proc_root: &Path, pid: ProcessId) -> io::Result<ProcessInfo> {
    let dir = proc_root.join(pid.to_string());
    let cwd = fs::read_link(dir.join("cwd"))?;
    let cmdline = format_cmdline(&fs::read(dir.join("cmdline"))?);
    Ok(ProcessInfo { pid, cwd, cmdline })
}

/// Enumerate every process under `proc_root`.
pub fn scan_processes(proc_root: &Path) -> InventoryScan {
    let mut scan = InventoryScan::default();

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
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        match read_process(proc_root, pid) {
            Ok(info) => {
                scan.processes.insert(pid, info);
            }
            Err(e) => {
                trace!(%pid, error = %e, "dropping process from inventory");
                scan.dropped += 1;
            }
        }
    }

    scan
}
