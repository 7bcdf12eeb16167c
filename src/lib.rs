#[macro_use]
extern crate log;

pub mod error;
pub mod key;
pub mod node;
pub mod protocol;
pub mod routing;
pub mod storage;
pub mod transport;

pub use crate::error::{Error, Result};
pub use crate::key::Key;
pub use crate::node::{Node, NodeConfig, Source};

/// Identifier width in bytes (160 bits).
pub const KEY_LENGTH: usize = 20;

/// One bucket per bit of the identifier.
pub const ROUTING_TABLE_SIZE: usize = KEY_LENGTH * 8;

/// Bucket width and replication factor (k).
pub const REPLICATION_PARAM: usize = 20;

/// Per-round lookup concurrency (alpha).
pub const CONCURRENCY_PARAM: usize = 3;

// Default per-RPC timeout in milliseconds
pub const REQUEST_TIMEOUT: u64 = 800;

// Socket read/write deadline in milliseconds; keeps the receive loop
// responsive to close()
pub const SOCKET_TIMEOUT: u64 = 5000;

/// Receive buffer size per datagram.
pub const BUFFER_SIZE: usize = 4096;
