//! Host state collection.
//!
//! Three independent, read-only gathers feed correlation:
//! - Kernel TCP connection tables (`net/tcp`, `net/tcp6`)
//! - Socket inode → owning pid, via an external listing or an fd walk
//! - Process inventory (cwd and command line per pid)
//!
//! The tool runner bounds the one external command involved.

pub mod conn_table;
pub mod proc_inventory;
pub mod socket_owner;
pub mod tool_runner;

pub use conn_table::{
    parse_connection_table, parse_connection_tables, read_connection_tables, ConnectionRecord,
    LocalAddress, ParsedTable, TcpState, DROPPED_COLUMNS, TABLE_FILES,
};
pub use proc_inventory::{
    format_cmdline, read_process, scan_processes, InventoryScan, ProcessInfo, ProcessInventory,
};
pub use socket_owner::{
    collect_from_fd_walk, collect_from_listing, collect_socket_owners, listing_failure,
    listing_spec, parse_listing_line, parse_socket_listing, socket_inode_from_link, ListingError,
    OwnerScan, SocketOwnerMap, SocketOwnership,
};
pub use tool_runner::{
    ToolConfig, ToolError, ToolOutput, ToolRunner, ToolSpec, DEFAULT_MAX_OUTPUT_BYTES,
    DEFAULT_TIMEOUT_MS,
};
