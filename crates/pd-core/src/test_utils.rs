//! Test utilities: a fake proc filesystem rooted in a temp directory.
//!
//! Builds the subset of `/proc` that discovery reads: `net/tcp`,
//! `net/tcp6`, and per-process `cwd`, `cmdline` and `fd/*` links. Socket
//! fds are dangling symlinks to `socket:[N]`, exactly as the kernel shows
//! them, so both `ls -l` and `read_link` see the real shape.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Header line shared by the fake `tcp` and `tcp6` tables.
pub const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

/// Build one connection-table row in kernel layout.
pub fn tcp_row(slot: usize, local: &str, state: &str, inode: u64) -> String {
    format!(
        "{:>4}: {} 00000000:0000 {} 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0",
        slot, local, state, inode
    )
}

/// A temporary directory laid out like `/proc`.
#[derive(Debug)]
pub struct FakeProcRoot {
    dir: TempDir,
}

impl Default for FakeProcRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcRoot {
    /// Create an empty root with a `net/` directory.
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("pd-fake-proc-")
            .tempdir()
            .unwrap();
        fs::create_dir_all(dir.path().join("net")).unwrap();
        FakeProcRoot { dir }
    }

    /// Create a root without `net/`, i.e. not a usable proc filesystem.
    pub fn without_net() -> Self {
        let root = Self::new();
        fs::remove_dir_all(root.path().join("net")).unwrap();
        root
    }

    /// Root path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Owned root path.
    pub fn path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Write `net/tcp` verbatim.
    pub fn set_tcp(&self, content: &str) {
        fs::write(self.path().join("net/tcp"), content).unwrap();
    }

    /// Write `net/tcp6` verbatim.
    pub fn set_tcp6(&self, content: &str) {
        fs::write(self.path().join("net/tcp6"), content).unwrap();
    }

    /// Write `net/tcp` from `(local_address, state, inode)` rows.
    pub fn set_tcp_rows(&self, rows: &[(&str, &str, u64)]) {
        self.set_tcp(&render_table(rows));
    }

    /// Write `net/tcp6` from `(local_address, state, inode)` rows.
    pub fn set_tcp6_rows(&self, rows: &[(&str, &str, u64)]) {
        self.set_tcp6(&render_table(rows));
    }

    /// Add a process directory with `cwd` link and `cmdline`.
    pub fn add_process(&self, pid: u32, cwd: &str, args: &[&str]) {
        let dir = self.path().join(pid.to_string());
        fs::create_dir_all(dir.join("fd")).unwrap();
        symlink(cwd, dir.join("cwd")).unwrap();
        let mut cmdline = Vec::new();
        for arg in args {
            cmdline.extend_from_slice(arg.as_bytes());
            cmdline.push(0);
        }
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    /// Add a `socket:[inode]` fd link to a process.
    pub fn add_socket_fd(&self, pid: u32, fd: u32, inode: u64) {
        let fd_dir = self.path().join(pid.to_string()).join("fd");
        fs::create_dir_all(&fd_dir).unwrap();
        symlink(format!("socket:[{}]", inode), fd_dir.join(fd.to_string())).unwrap();
    }

    /// Add a non-socket fd link to a process.
    pub fn add_plain_fd(&self, pid: u32, fd: u32, target: &str) {
        let fd_dir = self.path().join(pid.to_string()).join("fd");
        fs::create_dir_all(&fd_dir).unwrap();
        symlink(target, fd_dir.join(fd.to_string())).unwrap();
    }

    /// Add an empty directory (e.g. a process that already exited).
    pub fn add_bare_dir(&self, name: &str) {
        fs::create_dir_all(self.path().join(name)).unwrap();
    }

    /// Add a plain file at the root.
    pub fn add_file(&self, name: &str, content: &[u8]) {
        fs::write(self.path().join(name), content).unwrap();
    }
}

fn render_table(rows: &[(&str, &str, u64)]) -> String {
    let mut out = String::from(TCP_HEADER);
    out.push('\n');
    for (slot, (local, state, inode)) in rows.iter().enumerate() {
        out.push_str(&tcp_row(slot, local, state, *inode));
        out.push('\n');
    }
    out
}
