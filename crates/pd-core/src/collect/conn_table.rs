//! Kernel TCP connection table parsing.
//!
//! Parses `/proc/net/tcp` and `/proc/net/tcp6` into header-keyed rows.
//! Column positions are taken from the header line rather than assumed,
//! except for two header tokens that have no value of their own:
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 ...
//! ```
//!
//! `tx_queue rx_queue` and `tr tm->when` are printed as single
//! colon-joined values, so `rx_queue` and `tm->when` are dropped from the
//! header before aligning. The kernel also appends unnamed trailing values
//! (refcount, socket pointer, timers); those are kept under positional keys.

use pd_common::SocketInode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, trace};

/// Header tokens that share a value with their left neighbour.
pub const DROPPED_COLUMNS: [&str; 2] = ["rx_queue", "tm->when"];

/// Connection table files read under the proc root, in merge order.
pub const TABLE_FILES: [&str; 2] = ["net/tcp", "net/tcp6"];

/// TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    NewSynRecv,
    Unknown,
}

impl TcpState {
    /// Decode the `st` column.
    pub fn from_hex(hex: &str) -> Self {
        match u8::from_str_radix(hex, 16) {
            Ok(0x01) => TcpState::Established,
            Ok(0x02) => TcpState::SynSent,
            Ok(0x03) => TcpState::SynRecv,
            Ok(0x04) => TcpState::FinWait1,
            Ok(0x05) => TcpState::FinWait2,
            Ok(0x06) => TcpState::TimeWait,
            Ok(0x07) => TcpState::Close,
            Ok(0x08) => TcpState::CloseWait,
            Ok(0x09) => TcpState::LastAck,
            Ok(0x0A) => TcpState::Listen,
            Ok(0x0B) => TcpState::Closing,
            Ok(0x0C) => TcpState::NewSynRecv,
            _ => TcpState::Unknown,
        }
    }

    /// Whether this state is a listening socket.
    pub fn is_listen(&self) -> bool {
        matches!(self, TcpState::Listen)
    }
}

/// Decoded `local_address` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddress {
    /// Bound IP.
    pub ip: IpAddr,
    /// Bound port.
    pub port: u16,
}

impl LocalAddress {
    /// Decode `HEXIP:HEXPORT`. The IP width selects the family: 8 hex
    /// digits for IPv4, 32 for IPv6.
    pub fn parse(field: &str) -> Option<Self> {
        let (ip_hex, port_hex) = field.split_once(':')?;
        if port_hex.is_empty() || port_hex.len() > 4 {
            return None;
        }
        let port = u16::from_str_radix(port_hex, 16).ok()?;
        let ip = match ip_hex.len() {
            8 => IpAddr::V4(parse_ipv4_hex(ip_hex)?),
            32 => IpAddr::V6(parse_ipv6_hex(ip_hex)?),
            _ => return None,
        };
        Some(LocalAddress { ip, port })
    }
}

/// The kernel prints the address as a host-order `u32`, so on the
/// little-endian machines this runs on the bytes come out reversed.
fn parse_ipv4_hex(hex: &str) -> Option<Ipv4Addr> {
    let word = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(word.to_le_bytes()))
}

/// IPv6 is four host-order 32-bit words.
fn parse_ipv6_hex(hex: &str) -> Option<Ipv6Addr> {
    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        let word = u32::from_str_radix(hex.get(i * 8..(i + 1) * 8)?, 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(octets))
}

/// One data row of a connection table, keyed by header column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRecord {
    fields: BTreeMap<String, String>,
}

impl ConnectionRecord {
    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ConnectionRecord {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw value of a column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// All columns, including positional trailing ones.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Decoded `local_address`, or None when missing or malformed.
    pub fn local_address(&self) -> Option<LocalAddress> {
        self.get("local_address").and_then(LocalAddress::parse)
    }

    /// Decoded `st` column.
    pub fn state(&self) -> TcpState {
        self.get("st")
            .map(TcpState::from_hex)
            .unwrap_or(TcpState::Unknown)
    }

    /// Validated `inode` column.
    pub fn inode(&self) -> Option<SocketInode> {
        self.get("inode").and_then(|v| v.parse().ok())
    }

    /// Whether the row is in the listening state.
    pub fn is_listening(&self) -> bool {
        self.state().is_listen()
    }
}

/// Rows parsed from one or more tables.
#[derive(Debug, Clone, Default)]
pub struct ParsedTable {
    /// Accepted rows in input order.
    pub records: Vec<ConnectionRecord>,
    /// Data rows dropped for having fewer values than named columns.
    pub skipped_rows: usize,
}

impl ParsedTable {
    /// Append another table's rows after this one's.
    pub fn merge(&mut self, other: ParsedTable) {
        self.records.extend(other.records);
        self.skipped_rows += other.skipped_rows;
    }
}

/// Parse one connection table.
///
/// Never fails as a whole: a short row is skipped and counted, blank lines
/// are ignored, and input without a header yields nothing.
pub fn parse_connection_table(content: &str) -> ParsedTable {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let mut table = ParsedTable::default();

    let Some(header) = lines.next() else {
        return table;
    };
    let names: Vec<&str> = header
        .split_whitespace()
        .filter(|name| !DROPPED_COLUMNS.contains(name))
        .collect();

    for (line_no, line) in lines.enumerate() {
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() < names.len() {
            trace!(
                line = line_no + 2,
                values = values.len(),
                columns = names.len(),
                "skipping short connection row"
            );
            table.skipped_rows += 1;
            continue;
        }

        let record = ConnectionRecord::from_pairs(values.iter().enumerate().map(|(i, value)| {
            let key = names
                .get(i)
                .map(|n| n.to_string())
                .unwrap_or_else(|| i.to_string());
            (key, value.to_string())
        }));
        table.records.push(record);
    }

    table
}

/// Parse and concatenate several tables (e.g. tcp then tcp6).
pub fn parse_connection_tables<'a, I>(contents: I) -> ParsedTable
where
    I: IntoIterator<Item = &'a str>,
{
    let mut merged = ParsedTable::default();
    for content in contents {
        merged.merge(parse_connection_table(content));
    }
    merged
}

/// Read and parse every table in [`TABLE_FILES`] under `proc_root`.
///
/// Missing or unreadable tables are skipped; the second value is the
/// number of tables actually read.
pub fn read_connection_tables(proc_root: &Path) -> (ParsedTable, usize) {
    let mut merged = ParsedTable::default();
    let mut tables_read = 0;

    for name in TABLE_FILES {
        let path = proc_root.join(name);
        match fs::read_to_string(&path) {
            Ok(content) => {
                tables_read += 1;
                merged.merge(parse_connection_table(&content));
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "connection table unavailable");
            }
        }
    }

    (merged, tables_read)
}
