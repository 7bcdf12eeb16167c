use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::protocol::Message;
use crate::transport::{normalize_type, Handler, Transport, TransportFactory};
use crate::{BUFFER_SIZE, SOCKET_TIMEOUT};

type HandlerMap = Arc<RwLock<HashMap<String, Handler>>>;
type WaiterMap = Arc<Mutex<HashMap<String, Sender<Message>>>>;

/// The real datagram transport: one text message per UDP datagram.
///
/// Incoming datagrams are first matched against the waiter registry by RPC
/// ID; everything else goes through the handler registry for its type. The
/// receive loop runs on its own thread between `start` and `close`.
pub struct UdpTransport {
    socket: UdpSocket,
    addr: SocketAddr,
    handlers: HandlerMap,
    waiters: WaiterMap,
    closing: Arc<AtomicBool>,
    receive_loop: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UdpTransport {
    /// Binds a socket with the default read/write deadlines. The deadlines
    /// keep the loop checking the closing flag rather than blocking forever.
    pub fn bind(addr: SocketAddr) -> Result<Arc<UdpTransport>> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(SOCKET_TIMEOUT)))?;
        socket.set_write_timeout(Some(Duration::from_millis(SOCKET_TIMEOUT)))?;
        let addr = socket.local_addr()?;
        Ok(Arc::new(UdpTransport {
            socket,
            addr,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            closing: Arc::new(AtomicBool::new(false)),
            receive_loop: Mutex::new(None),
        }))
    }

    /// A `TransportFactory` producing UDP transports.
    pub fn factory() -> TransportFactory {
        Box::new(|addr| {
            let transport: Arc<dyn Transport> = UdpTransport::bind(addr)?;
            Ok(transport)
        })
    }

    fn run_receive_loop(
        socket: UdpSocket,
        handlers: HandlerMap,
        waiters: WaiterMap,
        closing: Arc<AtomicBool>,
    ) {
        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            let (len, src) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                    if closing.load(Ordering::Acquire) {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    if closing.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("receive failed: {}", err);
                    continue;
                }
            };
            if closing.load(Ordering::Acquire) {
                break;
            }

            let text = match str::from_utf8(&buffer[..len]) {
                Ok(text) => text,
                Err(err) => {
                    warn!("dropping non-utf8 datagram from {}: {}", src, err);
                    continue;
                }
            };
            let msg = match Message::parse(text) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("dropping malformed datagram from {}: {}", src, err);
                    continue;
                }
            };

            Self::dispatch(&socket, &handlers, &waiters, src, msg);
        }
    }

    fn dispatch(
        socket: &UdpSocket,
        handlers: &HandlerMap,
        waiters: &WaiterMap,
        src: SocketAddr,
        msg: Message,
    ) {
        if !msg.rpc_id.is_empty() {
            let waiter = waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&msg.rpc_id);
            if let Some(tx) = waiter {
                // A completed waiter may already be gone; duplicates fall
                // through to the handler pipeline below.
                let _ = tx.send(msg);
                return;
            }
        }

        let rpc_id = msg.rpc_id.clone();
        let reply = {
            let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(&msg.msg_type) {
                Some(handler) => match handler(src, &msg) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!("handler for {} failed on message from {}: {}", msg.msg_type, src, err);
                        None
                    }
                },
                None => {
                    error!("no handler for {} from {}", msg.msg_type, src);
                    None
                }
            }
        };

        if let Some(mut reply) = reply {
            if reply.rpc_id.is_empty() {
                reply.rpc_id = rpc_id;
            }
            if let Err(err) = socket.send_to(reply.encode().as_bytes(), src) {
                warn!("failed to reply to {}: {}", src, err);
            }
        }
    }
}

impl Transport for UdpTransport {
    fn on(&self, msg_type: &str, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_type(msg_type), handler);
    }

    fn start(&self) -> Result<()> {
        let socket = self.socket.try_clone()?;
        let handlers = Arc::clone(&self.handlers);
        let waiters = Arc::clone(&self.waiters);
        let closing = Arc::clone(&self.closing);
        let handle = thread::spawn(move || {
            Self::run_receive_loop(socket, handlers, waiters, closing);
        });
        *self.receive_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Cancel every outstanding waiter: dropping the senders makes the
        // pending send_and_wait calls observe a closed rendezvous.
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        // Wake the receive loop out of its read deadline.
        let _ = self.socket.send_to(&[], self.addr);
        let handle = self
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // Handlers hold clones of the node; dropping them here breaks the
        // node <-> transport reference cycle.
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
        self.socket.send_to(msg.encode().as_bytes(), to)?;
        Ok(())
    }

    fn send_and_wait(&self, to: SocketAddr, mut msg: Message, timeout: Duration) -> Result<Message> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::Canceled);
        }
        if msg.rpc_id.is_empty() {
            msg.rpc_id = Key::random().to_hex();
        }

        let (tx, rx) = mpsc::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg.rpc_id.clone(), tx);

        // close() may have drained the registry between the first check and
        // the insert; a waiter registered now would never be canceled.
        if self.closing.load(Ordering::Acquire) {
            self.waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&msg.rpc_id);
            return Err(Error::Canceled);
        }

        if let Err(err) = self.send(to, &msg) {
            self.waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&msg.rpc_id);
            return Err(err);
        }

        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&msg.rpc_id);
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Canceled),
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
