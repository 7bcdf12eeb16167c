//! Datagram transports.
//!
//! The node depends only on the [`Transport`] trait; the real UDP server
//! and the in-process loopback used by multi-node tests both implement it.

pub mod mock;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::Message;

/// A registered message handler. Receives the remote address and the parsed
/// message, and returns an optional reply that the transport writes back.
pub type Handler = Box<dyn Fn(SocketAddr, &Message) -> Result<Option<Message>> + Send + Sync>;

/// Builds a transport bound to the given address; injectable so tests can
/// swap the UDP server for the loopback.
pub type TransportFactory = Box<dyn Fn(SocketAddr) -> Result<Arc<dyn Transport>> + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Registers `handler` for a message type. The key is upper-cased and
    /// trimmed; the last registration wins.
    fn on(&self, msg_type: &str, handler: Handler);

    /// Enters the receive loop (in the background) until `close`.
    fn start(&self) -> Result<()>;

    /// Marks the transport closing, cancels all waiters, and tears down the
    /// receive loop. Idempotent.
    fn close(&self) -> Result<()>;

    fn addr(&self) -> SocketAddr;

    /// Fire-and-forget write.
    fn send(&self, to: SocketAddr, msg: &Message) -> Result<()>;

    /// Sends a request and waits for the correlated reply.
    ///
    /// Assigns a fresh RPC ID when the message carries none. Returns
    /// [`crate::Error::Timeout`] when the deadline elapses and
    /// [`crate::Error::Canceled`] when the transport closes underneath the
    /// caller.
    fn send_and_wait(&self, to: SocketAddr, msg: Message, timeout: Duration) -> Result<Message>;
}

pub(crate) fn normalize_type(msg_type: &str) -> String {
    msg_type.trim().to_uppercase()
}
