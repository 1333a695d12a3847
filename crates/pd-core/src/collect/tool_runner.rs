//! Bounded execution of external listing commands.
//!
//! The socket-owner listing is the only subprocess discovery spawns, and
//! discovery must never block indefinitely. Every run here is bounded:
//!
//! - Wall-clock timeout with SIGTERM → SIGKILL escalation
//! - The child leads its own process group, so pipelines spawned by
//!   `sh -c` are signalled together
//! - Output size caps to prevent memory exhaustion
//! - Scrubbed environment (`LC_ALL=C`) and optional `nice`
//!
//! A timeout is not an error: the output captured so far is returned with
//! `timed_out` set, and the caller decides whether partial data is usable.

use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

/// Default timeout per command in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default maximum output size in bytes (16MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL in milliseconds.
const SIGTERM_GRACE_MS: u64 = 200;

/// How long to wait for pipe readers after the child is gone.
const DRAIN_GRACE_MS: u64 = 250;

/// Poll interval while waiting on the child.
const POLL_INTERVAL_MS: u64 = 10;

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command path: {0}")]
    InvalidPath(String),
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    /// Command that was executed.
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Standard output (may be truncated).
    pub stdout: Vec<u8>,
    /// Standard error (may be truncated).
    pub stderr: Vec<u8>,
    /// Exit code, None if killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether either stream hit the output cap.
    pub truncated: bool,
    /// Execution duration.
    pub duration: Duration,
    /// Whether the command was killed for running past its timeout.
    pub timed_out: bool,
}

impl ToolOutput {
    /// Get stdout as string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Configuration for the tool runner.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Default timeout per command.
    pub default_timeout: Duration,
    /// Maximum output size per stream in bytes.
    pub max_output_bytes: usize,
    /// Use nice to lower priority.
    pub use_nice: bool,
    /// Nice value (0-19, higher = lower priority).
    pub nice_value: i32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            use_nice: true,
            nice_value: 10,
        }
    }
}

/// Specification for a tool to run.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Command to execute.
    pub command: String,
    /// Arguments to pass.
    pub args: Vec<String>,
    /// Override timeout (None = use default).
    pub timeout: Option<Duration>,
    /// Override max output (None = use default).
    pub max_output: Option<usize>,
}

impl ToolSpec {
    /// Create a new tool specification.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
            max_output: None,
        }
    }
}

/// Runs external commands under a timeout and output cap.
#[derive(Debug, Clone, Default)]
pub struct ToolRunner {
    config: ToolConfig,
}

impl ToolRunner {
    /// Create a new tool runner with the given configuration.
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// The runner's configuration.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Run a single command with the given arguments.
    pub fn run_tool(
        &self,
        cmd: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        let spec = ToolSpec {
            command: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout,
            max_output: None,
        };
        self.run(&spec)
    }

    /// Run a tool from a specification.
    #[instrument(skip(self), fields(cmd = %spec.command))]
    pub fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        validate_command(&spec.command)?;

        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        let max_output = spec.max_output.unwrap_or(self.config.max_output_bytes);

        debug!(
            command = %spec.command,
            args = ?spec.args,
            timeout_ms = timeout.as_millis() as u64,
            max_output,
            "running tool"
        );

        let start = Instant::now();
        let mut child = self
            .build_command(&spec.command, &spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!(command = %spec.command, error = %e, "failed to spawn");
                ToolError::SpawnFailed(e.to_string())
            })?;

        let stdout = StreamCapture::start(child.stdout.take(), max_output);
        let stderr = StreamCapture::start(child.stderr.take(), max_output);

        let (exit_code, timed_out) = wait_with_deadline(&mut child, start + timeout)?;

        let (stdout, stdout_truncated) = stdout.finish();
        let (stderr, stderr_truncated) = stderr.finish();
        let duration = start.elapsed();

        debug!(
            command = %spec.command,
            duration_ms = duration.as_millis() as u64,
            exit_code = ?exit_code,
            timed_out,
            stdout_bytes = stdout.len(),
            "tool execution complete"
        );

        Ok(ToolOutput {
            command: spec.command.clone(),
            args: spec.args.clone(),
            stdout,
            stderr,
            exit_code,
            truncated: stdout_truncated || stderr_truncated,
            duration,
            timed_out,
        })
    }

    /// Build the command with a nice wrapper if configured.
    fn build_command(&self, cmd: &str, args: &[String]) -> Command {
        let mut command = if self.config.use_nice && cfg!(unix) {
            let mut c = Command::new("nice");
            c.arg("-n").arg(self.config.nice_value.to_string()).arg(cmd);
            c
        } else {
            Command::new(cmd)
        };
        command.args(args);

        command.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        command.env("LC_ALL", "C");
        command.env("LANG", "C");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }
}

/// Reject command names that would smuggle shell syntax.
fn validate_command(cmd: &str) -> Result<(), ToolError> {
    if cmd.is_empty() {
        return Err(ToolError::InvalidPath("empty command".to_string()));
    }
    if cmd.contains(['|', '&', ';', '$', '`', '\n', '\r', ' ']) {
        return Err(ToolError::InvalidPath(format!(
            "command contains shell metacharacters: {}",
            cmd
        )));
    }
    if cmd.starts_with('/') && !Path::new(cmd).exists() {
        return Err(ToolError::CommandNotFound(cmd.to_string()));
    }
    Ok(())
}

/// Poll the child until it exits or the deadline passes.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
) -> Result<(Option<i32>, bool), ToolError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                trace!(exit_code = ?status.code(), "process exited");
                return Ok((status.code(), false));
            }
            Ok(None) if Instant::now() >= deadline => {
                warn!(pid = child.id(), "command timed out, terminating");
                kill_with_grace(child);
                let status = child.wait().ok();
                return Ok((status.and_then(|s| s.code()), true));
            }
            Ok(None) => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
            Err(e) => {
                error!(error = %e, "failed to wait for child");
                kill_with_grace(child);
                return Err(ToolError::Io(e));
            }
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL after a grace period.
#[cfg(unix)]
fn kill_with_grace(child: &mut Child) {
    let pgid = child.id() as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    debug!(pgid, "sent SIGTERM to process group");

    let deadline = Instant::now() + Duration::from_millis(SIGTERM_GRACE_MS);
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            trace!(pgid, "process exited after SIGTERM");
            // Pipeline members may outlive the leader.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
            return;
        }
        thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }

    warn!(pgid, "process did not exit after SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_with_grace(child: &mut Child) {
    let _ = child.kill();
}

#[derive(Debug, Default)]
struct CaptureBuf {
    data: Vec<u8>,
    truncated: bool,
}

/// Background reader for one child pipe.
///
/// The reader keeps draining past the cap so the child never blocks on a
/// full pipe; bytes beyond the cap are discarded.
struct StreamCapture {
    buf: Arc<Mutex<CaptureBuf>>,
    done: Option<mpsc::Receiver<()>>,
}

impl StreamCapture {
    fn start<R: Read + Send + 'static>(stream: Option<R>, limit: usize) -> Self {
        let buf = Arc::new(Mutex::new(CaptureBuf::default()));
        let Some(mut stream) = stream else {
            return StreamCapture { buf, done: None };
        };

        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&buf);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut guard = shared.lock().unwrap_or_else(|p| p.into_inner());
                        let space = limit.saturating_sub(guard.data.len());
                        if n > space {
                            guard.truncated = true;
                        }
                        let take = n.min(space);
                        guard.data.extend_from_slice(&chunk[..take]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });

        StreamCapture { buf, done: Some(rx) }
    }

    /// Wait briefly for EOF, then take whatever was captured.
    fn finish(self) -> (Vec<u8>, bool) {
        if let Some(done) = self.done {
            if done
                .recv_timeout(Duration::from_millis(DRAIN_GRACE_MS))
                .is_err()
            {
                debug!("pipe still open after child exit; using captured prefix");
            }
        }
        let mut guard = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        (std::mem::take(&mut guard.data), guard.truncated)
    }
}
