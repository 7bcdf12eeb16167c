use std::net::SocketAddr;
use std::time::Duration;

use kadht::transport::mock::MockTransport;
use kadht::{Key, Node, NodeConfig, REPLICATION_PARAM};

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

#[test]
fn test_ping_pong_over_loopback() {
    let a = mock_node(10001, &[]);
    let b = mock_node(10002, &[]);

    let id = b
        .ping_sync(a.addr(), Duration::from_millis(500))
        .expect("ping failed");
    assert_eq!(id, *a.id());

    // The ping handler opportunistically learned about b.
    let known = a.closest_contacts(b.id(), REPLICATION_PARAM);
    assert!(known.iter().any(|contact| contact.id == *b.id()));

    a.shutdown(Duration::from_secs(1)).unwrap();
    b.shutdown(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_ping_dead_peer_fails() {
    let a = mock_node(10003, &[]);
    assert!(a.ping_sync(addr(10004), Duration::from_millis(200)).is_err());
    a.shutdown(Duration::from_secs(1)).unwrap();
}
