pub mod contact;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::Key;
use crate::node::contact::Contact;
use crate::protocol::{
    Message, MSG_FIND_NODE, MSG_GET, MSG_NODES, MSG_NOT_FOUND, MSG_PING, MSG_PONG, MSG_STORE,
    MSG_STORED, MSG_VALUE,
};
use crate::routing::RoutingTable;
use crate::storage::Storage;
use crate::transport::{Transport, TransportFactory};
use crate::{CONCURRENCY_PARAM, REPLICATION_PARAM, REQUEST_TIMEOUT};

/// Node startup configuration.
pub struct NodeConfig {
    pub id: Key,
    pub addr: SocketAddr,
    /// Known peers probed during the join; failures are non-fatal per peer.
    pub peers: Vec<SocketAddr>,
    /// Injectable so tests can run whole meshes over the loopback transport.
    pub transport: TransportFactory,
}

/// Where a retrieved value came from.
#[derive(Debug, Clone)]
pub enum Source {
    Local,
    Peer(Contact),
}

/// A node in the DHT.
///
/// Owns the routing table and the local store, serves the wire protocol
/// handlers, and runs the iterative lookup clients. Cloning is cheap; all
/// clones share the same state.
#[derive(Clone)]
pub struct Node {
    me: Contact,
    server: Arc<dyn Transport>,
    routing: Arc<RwLock<RoutingTable>>,
    storage: Arc<RwLock<Storage>>,
}

fn arg<'a>(msg: &'a Message, index: usize) -> Result<&'a str> {
    msg.args
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::Parse(format!("{} is missing argument {}", msg.msg_type, index)))
}

impl Node {
    /// Builds the transport, registers the protocol handlers, starts the
    /// receive loop, and joins the network through the configured peers.
    pub fn create(config: NodeConfig) -> Result<Node> {
        let server = (config.transport)(config.addr)?;
        let me = Contact::new(config.id, server.addr());
        info!("{} - starting node {}", me.address, me.id);

        let node = Node {
            me: me.clone(),
            server,
            routing: Arc::new(RwLock::new(RoutingTable::new(me))),
            storage: Arc::new(RwLock::new(Storage::new())),
        };
        node.register_handlers();
        node.server.start()?;
        node.join(&config.peers);
        Ok(node)
    }

    pub fn id(&self) -> &Key {
        &self.me.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.me.address
    }

    pub fn contact(&self) -> Contact {
        self.me.clone()
    }

    /// The `count` known contacts closest to `target` by XOR distance.
    pub fn closest_contacts(&self, target: &Key, count: usize) -> Vec<Contact> {
        self.routing_read().find_closest(target, count)
    }

    /// Drops a peer from the routing table.
    pub fn remove_contact(&self, id: &Key) {
        self.routing_write().remove_contact(id);
    }

    /// Closes the transport, waiting at most `deadline` for the receive
    /// loop to drain. Idempotent.
    pub fn shutdown(&self, deadline: Duration) -> Result<()> {
        let server = Arc::clone(&self.server);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(server.close());
        });
        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn routing_read(&self) -> RwLockReadGuard<RoutingTable> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn routing_write(&self) -> RwLockWriteGuard<RoutingTable> {
        self.routing.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_read(&self) -> RwLockReadGuard<Storage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_write(&self) -> RwLockWriteGuard<Storage> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_handlers(&self) {
        let node = self.clone();
        self.server
            .on(MSG_PING, Box::new(move |from, msg| node.handle_ping(from, msg)));
        let node = self.clone();
        self.server
            .on(MSG_PONG, Box::new(move |from, msg| node.handle_pong(from, msg)));
        let node = self.clone();
        self.server.on(
            MSG_FIND_NODE,
            Box::new(move |from, msg| node.handle_find_node(from, msg)),
        );
        let node = self.clone();
        self.server
            .on(MSG_STORE, Box::new(move |from, msg| node.handle_store(from, msg)));
        let node = self.clone();
        self.server
            .on(MSG_GET, Box::new(move |from, msg| node.handle_get(from, msg)));
    }

    /// Probes each configured peer and looks up the own ID through it to
    /// populate the nearby buckets.
    fn join(&self, peers: &[SocketAddr]) {
        let timeout = Duration::from_millis(REQUEST_TIMEOUT);
        for &peer in peers {
            match self.ping_sync(peer, timeout) {
                Ok(peer_id) => {
                    self.observe_contact(Contact::new(peer_id, peer));
                    let target = self.me.id;
                    let neighbors = self.iterative_find_node(&target, timeout);
                    info!(
                        "{} - joined via {}, {} neighbors discovered",
                        self.me.address,
                        peer,
                        neighbors.len()
                    );
                }
                Err(err) => warn!("{} - bootstrap peer {} unreachable: {}", self.me.address, peer, err),
            }
        }
    }

    /// Inserts or refreshes a peer through the eviction-aware path.
    ///
    /// When the bucket is full, the table hands back its least recently
    /// seen contact and this spawns a probe thread, so no routing lock is
    /// ever held across the PING.
    fn observe_contact(&self, contact: Contact) {
        let candidate = self.routing_write().add_contact(contact.clone());
        if let Some(candidate) = candidate {
            let node = self.clone();
            thread::spawn(move || node.resolve_eviction(candidate, contact));
        }
    }

    fn resolve_eviction(&self, candidate: Contact, newcomer: Contact) {
        match self.ping_sync(candidate.address, Duration::from_millis(REQUEST_TIMEOUT)) {
            Ok(_) => {
                debug!(
                    "{} - keeping live contact {:?}, dropping {:?}",
                    self.me.address, candidate, newcomer
                );
                self.routing_write().add_contact(candidate);
            }
            Err(err) => {
                debug!(
                    "{} - evicting {:?} after failed probe ({}), inserting {:?}",
                    self.me.address, candidate, err, newcomer
                );
                let mut table = self.routing_write();
                table.remove_contact(&candidate.id);
                table.add_contact(newcomer);
            }
        }
    }

    fn handle_ping(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let sender = Key::from_hex(arg(msg, 0)?)?;
        self.observe_contact(Contact::new(sender, from));
        Ok(Some(Message::new(MSG_PONG, vec![self.me.id.to_hex()])))
    }

    // An unsolicited PONG, i.e. one that matched no waiter. Still good
    // evidence the sender is alive.
    fn handle_pong(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let sender = Key::from_hex(arg(msg, 0)?)?;
        self.observe_contact(Contact::new(sender, from));
        Ok(None)
    }

    fn handle_find_node(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let sender = Key::from_hex(arg(msg, 0)?)?;
        let target = Key::from_hex(arg(msg, 1)?)?;
        self.observe_contact(Contact::new(sender, from));

        // One extra candidate so dropping the requester still leaves k.
        let mut closest = self.routing_read().find_closest(&target, REPLICATION_PARAM + 1);
        closest.retain(|contact| contact.id != sender);
        closest.truncate(REPLICATION_PARAM);

        let mut args = Vec::with_capacity(closest.len() + 1);
        args.push(self.me.id.to_hex());
        args.extend(closest.iter().map(Contact::to_token));
        Ok(Some(Message::new(MSG_NODES, args)))
    }

    fn handle_store(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let sender = Key::from_hex(arg(msg, 0)?)?;
        let key = Key::from_hex(arg(msg, 1)?)?;
        let value = hex::decode(arg(msg, 2)?)
            .map_err(|err| Error::Parse(format!("bad STORE payload: {}", err)))?;
        self.observe_contact(Contact::new(sender, from));

        let key_hex = key.to_hex();
        debug!("{} - storing {} ({} bytes)", self.me.address, key_hex, value.len());
        self.storage_write().insert(key_hex.clone(), &value);
        Ok(Some(Message::new(MSG_STORED, vec![self.me.id.to_hex(), key_hex])))
    }

    fn handle_get(&self, from: SocketAddr, msg: &Message) -> Result<Option<Message>> {
        let sender = Key::from_hex(arg(msg, 0)?)?;
        let key = Key::from_hex(arg(msg, 1)?)?;
        self.observe_contact(Contact::new(sender, from));

        let key_hex = key.to_hex();
        let reply = match self.storage_read().get(&key_hex) {
            Some(value) => Message::new(
                MSG_VALUE,
                vec![self.me.id.to_hex(), key_hex, hex::encode(value)],
            ),
            None => Message::new(MSG_NOT_FOUND, vec![self.me.id.to_hex(), key_hex]),
        };
        Ok(Some(reply))
    }

    /// Sends a `PING` RPC and returns the responder's ID.
    pub fn ping_sync(&self, addr: SocketAddr, timeout: Duration) -> Result<Key> {
        let req = Message::new(MSG_PING, vec![self.me.id.to_hex()]);
        let reply = self.server.send_and_wait(addr, req, timeout)?;
        if reply.msg_type != MSG_PONG || reply.args.is_empty() {
            return Err(Error::Protocol(format!(
                "unexpected reply to PING: {}",
                reply.encode()
            )));
        }
        Key::from_hex(&reply.args[0])
    }

    /// Sends a `FIND_NODE` RPC; returned contacts carry their distance to
    /// `target`. Unparseable contact tokens are skipped.
    pub fn find_nodes_sync(
        &self,
        addr: SocketAddr,
        target: &Key,
        timeout: Duration,
    ) -> Result<Vec<Contact>> {
        let req = Message::new(MSG_FIND_NODE, vec![self.me.id.to_hex(), target.to_hex()]);
        let reply = self.server.send_and_wait(addr, req, timeout)?;
        if reply.msg_type != MSG_NODES || reply.args.is_empty() {
            return Err(Error::Protocol(format!(
                "unexpected reply to FIND_NODE: {}",
                reply.encode()
            )));
        }

        let mut contacts = Vec::with_capacity(reply.args.len() - 1);
        for token in &reply.args[1..] {
            match Contact::from_token_with_distance(token, target) {
                Ok(contact) => contacts.push(contact),
                Err(err) => warn!(
                    "{} - skipping bad contact token from {}: {}",
                    self.me.address, addr, err
                ),
            }
        }
        Ok(contacts)
    }

    /// Sends a `STORE` RPC.
    fn store_sync(
        &self,
        addr: SocketAddr,
        key_hex: &str,
        value: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let req = Message::new(
            MSG_STORE,
            vec![self.me.id.to_hex(), key_hex.to_string(), hex::encode(value)],
        );
        let reply = self.server.send_and_wait(addr, req, timeout)?;
        if reply.msg_type != MSG_STORED {
            return Err(Error::Protocol(format!(
                "unexpected reply to STORE: {}",
                reply.encode()
            )));
        }
        Ok(())
    }

    /// Sends a `GET` RPC. `Ok(None)` means the peer answered NOT_FOUND.
    fn get_value_sync(
        &self,
        addr: SocketAddr,
        key_hex: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let req = Message::new(MSG_GET, vec![self.me.id.to_hex(), key_hex.to_string()]);
        let reply = self.server.send_and_wait(addr, req, timeout)?;
        match reply.msg_type.as_str() {
            MSG_VALUE => {
                let payload = arg(&reply, 2)
                    .map_err(|_| Error::Protocol("VALUE reply is missing its payload".to_string()))?;
                let value = hex::decode(payload)
                    .map_err(|err| Error::Parse(format!("bad VALUE payload: {}", err)))?;
                Ok(Some(value))
            }
            MSG_NOT_FOUND => Ok(None),
            _ => Err(Error::Protocol(format!(
                "unexpected reply to GET: {}",
                reply.encode()
            ))),
        }
    }

    /// Iteratively converges on the k closest known contacts to `target`.
    ///
    /// Each round queries up to alpha unqueried shortlist entries in
    /// parallel and merges whatever comes back. Querying continues until a
    /// round makes no progress and k peers have answered, or the shortlist
    /// runs out of candidates. Failed RPCs are skipped, not retried. The
    /// result is sorted ascending by distance to `target`.
    pub fn iterative_find_node(&self, target: &Key, timeout: Duration) -> Vec<Contact> {
        let mut shortlist = self.routing_read().find_closest(target, REPLICATION_PARAM);
        let mut queried: HashSet<Key> = HashSet::new();
        let mut active = 0;

        loop {
            let wave: Vec<Contact> = shortlist
                .iter()
                .filter(|contact| !queried.contains(&contact.id))
                .take(CONCURRENCY_PARAM)
                .cloned()
                .collect();
            if wave.is_empty() {
                break;
            }
            for contact in &wave {
                queried.insert(contact.id);
            }

            let (tx, rx) = mpsc::channel();
            for contact in wave {
                let node = self.clone();
                let target = *target;
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = node.find_nodes_sync(contact.address, &target, timeout);
                    if tx.send((contact, result)).is_err() {
                        warn!("receiver closed channel before rpc returned");
                    }
                });
            }
            drop(tx);

            let mut progress = false;
            for (contact, result) in rx {
                let found = match result {
                    Ok(found) => found,
                    Err(err) => {
                        debug!(
                            "{} - FIND_NODE to {:?} failed: {}",
                            self.me.address, contact, err
                        );
                        // Unresponsive peers are dropped from the table;
                        // the shortlist entry stays for the final result.
                        self.routing_write().remove_contact(&contact.id);
                        continue;
                    }
                };
                active += 1;
                for discovered in found {
                    if discovered.id == self.me.id {
                        continue;
                    }
                    self.observe_contact(discovered.clone());
                    if !shortlist.iter().any(|c| c.id == discovered.id) {
                        shortlist.push(discovered);
                        progress = true;
                    }
                }
            }

            shortlist.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
            shortlist.truncate(REPLICATION_PARAM);
            // A stalled round ends the lookup only once k peers have
            // answered; until then the remaining candidates are queried.
            if !progress && active >= REPLICATION_PARAM {
                break;
            }
        }

        shortlist
    }

    /// Locates a value: the local store first, then GET RPCs to the lookup
    /// result in alpha-sized batches. The first decodable VALUE wins; the
    /// rest of its batch is discarded. `None` as the source means the value
    /// was local.
    pub fn iterative_find_value(
        &self,
        key: &Key,
        timeout: Duration,
    ) -> Result<(Vec<u8>, Option<Contact>)> {
        let key_hex = key.to_hex();
        {
            let storage = self.storage_read();
            if let Some(value) = storage.get(&key_hex) {
                return Ok((value.to_vec(), None));
            }
        }

        let closest = self.iterative_find_node(key, timeout);
        if closest.is_empty() {
            return Err(Error::NoContacts);
        }

        for batch in closest.chunks(CONCURRENCY_PARAM) {
            let (tx, rx) = mpsc::channel();
            for contact in batch {
                let node = self.clone();
                let contact = contact.clone();
                let key_hex = key_hex.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = node.get_value_sync(contact.address, &key_hex, timeout);
                    // A send failure means a sibling already won the batch;
                    // the late result is discarded on purpose.
                    let _ = tx.send((contact, result));
                });
            }
            drop(tx);

            for (contact, result) in rx {
                match result {
                    Ok(Some(value)) => {
                        debug!("{} - found {} on {:?}", self.me.address, key_hex, contact);
                        return Ok((value, Some(contact)));
                    }
                    Ok(None) => {
                        debug!("{} - {:?} does not have {}", self.me.address, contact, key_hex)
                    }
                    Err(err) => {
                        debug!("{} - GET to {:?} failed: {}", self.me.address, contact, err)
                    }
                }
            }
        }

        Err(Error::NotFound)
    }

    /// Stores `data` under its SHA-1 hash on the k closest nodes and in the
    /// local store. Individual STORE failures are logged and tolerated.
    pub fn put(&self, data: &[u8]) -> Result<Key> {
        if data.is_empty() {
            return Err(Error::EmptyValue);
        }
        let key = Key::hash(data);
        let key_hex = key.to_hex();
        let timeout = Duration::from_millis(REQUEST_TIMEOUT);

        let targets = self.iterative_find_node(&key, timeout);
        let (tx, rx) = mpsc::channel();
        for contact in targets {
            let node = self.clone();
            let key_hex = key_hex.clone();
            let value = data.to_vec();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = node.store_sync(contact.address, &key_hex, &value, timeout);
                let _ = tx.send((contact, result));
            });
        }
        drop(tx);
        for (contact, result) in rx {
            if let Err(err) = result {
                warn!(
                    "{} - STORE of {} on {:?} failed: {}",
                    self.me.address, key_hex, contact, err
                );
            }
        }

        self.storage_write().insert(key_hex, data);
        Ok(key)
    }

    /// Retrieves a value by its content hash.
    pub fn get(&self, key: &Key, timeout: Duration) -> Result<(Vec<u8>, Source)> {
        let (value, from) = self.iterative_find_value(key, timeout)?;
        match from {
            Some(contact) => Ok((value, Source::Peer(contact))),
            None => Ok((value, Source::Local)),
        }
    }
}
