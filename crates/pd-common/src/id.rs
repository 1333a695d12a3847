//! Validated identity types for the discovery joins.
//!
//! Both keys arrive as text (directory names under `/proc`, bracketed
//! numbers in link targets, a decimal column in the connection table), so
//! parsing is strict: ASCII digits only, no sign, no surrounding whitespace,
//! no overflow. Anything else is not a key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a textual key failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("empty key")]
    Empty,
    #[error("non-digit character in key: {0:?}")]
    NonDigit(String),
    #[error("key out of range: {0}")]
    Overflow(String),
}

fn parse_decimal<T: FromStr>(s: &str) -> Result<T, KeyParseError> {
    if s.is_empty() {
        return Err(KeyParseError::Empty);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyParseError::NonDigit(s.to_string()));
    }
    s.parse::<T>()
        .map_err(|_| KeyParseError::Overflow(s.to_string()))
}

/// Process ID wrapper with display formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl FromStr for ProcessId {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s).map(ProcessId)
    }
}

/// Kernel socket inode number, the key linking a connection-table row to
/// the `socket:[N]` file descriptors that reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketInode(pub u64);

impl SocketInode {
    /// Inode 0 appears for sockets in TIME_WAIT and similar orphaned rows;
    /// no file descriptor can ever reference it.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SocketInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SocketInode {
    fn from(inode: u64) -> Self {
        SocketInode(inode)
    }
}

impl FromStr for SocketInode {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s).map(SocketInode)
    }
}
