use std::net::SocketAddr;
use std::time::Duration;

use kadht::node::Source;
use kadht::protocol::{Message, MSG_STORE, MSG_STORED};
use kadht::transport::mock::MockTransport;
use kadht::transport::Transport;
use kadht::{Key, Node, NodeConfig};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn mock_node(port: u16, peers: &[u16]) -> Node {
    Node::create(NodeConfig {
        id: Key::random(),
        addr: addr(port),
        peers: peers.iter().map(|&peer| addr(peer)).collect(),
        transport: MockTransport::factory(),
    })
    .unwrap()
}

/// Plants a value on `node` over the wire, as if a remote peer issued the
/// STORE, without replicating it anywhere else.
fn store_directly(node: &Node, key: &Key, value: &[u8], port: u16) {
    let injector = MockTransport::open(addr(port));
    let msg = Message::new(
        MSG_STORE,
        vec![Key::random().to_hex(), key.to_hex(), hex::encode(value)],
    );
    let reply = injector
        .send_and_wait(node.addr(), msg, Duration::from_millis(500))
        .expect("STORE failed");
    assert_eq!(reply.msg_type, MSG_STORED);
    injector.close().unwrap();
}

#[test]
fn test_content_addressed_put_get() {
    let a = mock_node(22001, &[]);
    let b = mock_node(22002, &[22001]);

    let key = a.put(b"Hello").expect("put failed");
    assert_eq!(key.to_hex(), "f7ff9e8b7bb2e09b70935a5d785e0cc5d9d0abf0");

    let (value, _source) = b.get(&key, Duration::from_millis(800)).expect("get failed");
    assert_eq!(value, b"Hello");

    a.shutdown(Duration::from_secs(1)).unwrap();
    b.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_get_reports_the_remote_source() {
    let a = mock_node(23001, &[]);
    let b = mock_node(23002, &[23001]);

    // Only a holds the value, so b must fetch it remotely.
    let value = b"Hello, StoreAndRetrieve";
    let key = Key::hash(value);
    store_directly(&a, &key, value, 23003);

    let (found, source) = b.get(&key, Duration::from_millis(800)).expect("get failed");
    assert_eq!(found, value);
    match source {
        Source::Peer(contact) => assert_eq!(contact.id, *a.id()),
        Source::Local => panic!("value should have come from a remote contact"),
    }

    a.shutdown(Duration::from_secs(1)).unwrap();
    b.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_removed_storer_makes_value_unreachable() {
    let a = mock_node(21001, &[]);
    let b = mock_node(21002, &[21001]);

    let value = b"Goodbye, Node A";
    let key = Key::hash(value);
    store_directly(&a, &key, value, 21003);

    // Reachable while a is alive.
    let (found, _) = b.get(&key, Duration::from_millis(800)).expect("get failed");
    assert_eq!(found, value);

    // Kill the only storer and forget it.
    a.shutdown(Duration::from_secs(1)).unwrap();
    b.remove_contact(a.id());

    assert!(b.get(&key, Duration::from_millis(200)).is_err());

    b.shutdown(Duration::from_secs(1)).unwrap();
}
