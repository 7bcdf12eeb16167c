//! An in-process loopback transport for deterministic multi-node tests.
//!
//! Transports register themselves in a process-wide address registry;
//! sending dispatches straight into the peer's handlers on the caller's
//! thread. Closing deregisters the transport, after which sends to it fail
//! the way sends to a dead host do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::protocol::Message;
use crate::transport::{normalize_type, Handler, Transport, TransportFactory};

static REGISTRY: Lazy<RwLock<HashMap<SocketAddr, Arc<MockTransport>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn lookup(addr: SocketAddr) -> Option<Arc<MockTransport>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&addr)
        .cloned()
}

pub struct MockTransport {
    addr: SocketAddr,
    handlers: RwLock<HashMap<String, Handler>>,
}

impl MockTransport {
    /// Creates a transport and registers it under `addr`. A later open on
    /// the same address replaces the earlier registration.
    pub fn open(addr: SocketAddr) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport {
            addr,
            handlers: RwLock::new(HashMap::new()),
        });
        REGISTRY
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Arc::clone(&transport));
        transport
    }

    /// A `TransportFactory` producing loopback transports.
    pub fn factory() -> TransportFactory {
        Box::new(|addr| {
            let transport: Arc<dyn Transport> = MockTransport::open(addr);
            Ok(transport)
        })
    }

    fn handle(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        match handlers.get(&msg.msg_type) {
            Some(handler) => handler(from, msg),
            None => Err(Error::Transport(format!(
                "no handler for {} at {}",
                msg.msg_type, self.addr
            ))),
        }
    }
}

impl Transport for MockTransport {
    fn on(&self, msg_type: &str, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_type(msg_type), handler);
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        REGISTRY
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.addr);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(&self, to: SocketAddr, msg: &Message) -> Result<()> {
        let peer = lookup(to).ok_or_else(|| Error::Transport(format!("no peer at {}", to)))?;
        // An unsolicited reply is delivered back through our own handlers,
        // mirroring the real transport's handler pipeline.
        if let Some(reply) = peer.handle(self.addr, msg)? {
            let _ = self.handle(peer.addr, &reply);
        }
        Ok(())
    }

    fn send_and_wait(&self, to: SocketAddr, mut msg: Message, _timeout: Duration) -> Result<Message> {
        if msg.rpc_id.is_empty() {
            msg.rpc_id = Key::random().to_hex();
        }
        let peer = lookup(to).ok_or_else(|| Error::Transport(format!("no peer at {}", to)))?;
        let mut reply = peer
            .handle(self.addr, &msg)?
            .ok_or_else(|| Error::Transport(format!("no reply from {}", to)))?;
        // echo the correlation ID like the real transport does
        if reply.rpc_id.is_empty() {
            reply.rpc_id = msg.rpc_id;
        }
        Ok(reply)
    }
}
