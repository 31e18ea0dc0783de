//! End-to-end tests driving two live `Node`s over real TCP loopback
//! connections: HELLO/WELCOME handshake, X3DH session establishment,
//! and bidirectional Double Ratchet message exchange.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use veilnet_crypto::IdentityStore;
use veilnet_node::node::Node;
use veilnet_node::persistence::Paths;

fn test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static COUNTER: AtomicU16 = AtomicU16::new(0);
    19000 + COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_paths() -> Paths {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("veilnet-node-it-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    Paths::new(dir)
}

async fn spawn_listening_node(addr: &str) -> std::sync::Arc<Node> {
    let node = Node::new(IdentityStore::generate(), test_paths(), CancellationToken::new());
    node.paths().ensure_dirs().unwrap();
    let listener = node.clone();
    let addr = addr.to_string();
    tokio::spawn(async move {
        listener.listen(&addr).await.unwrap();
    });
    // give the accept loop a moment to bind before any peer dials it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    node
}

/// Scenario 1 ("happy path"): A establishes a session against B's
/// published bundle, sends a message, B replies, both sides see the
/// plaintext the other side sent.
#[tokio::test]
async fn happy_path_session_establishment_and_reply() {
    let addr_b = format!("127.0.0.1:{}", test_port());
    let node_b = spawn_listening_node(&addr_b).await;
    let node_a = Node::new(IdentityStore::generate(), test_paths(), CancellationToken::new());

    let port: u16 = addr_b.rsplit(':').next().unwrap().parse().unwrap();
    let peer_b = node_a.connect("127.0.0.1", port).await.expect("handshake with B");
    assert_eq!(peer_b, node_b.node_id());

    let bundle_b = node_b.bundle().await;
    let established_peer = node_a.begin_session(&bundle_b, b"hello").await.expect("begin_session");
    assert_eq!(established_peer, node_b.node_id());

    let (from, plaintext) = tokio::time::timeout(Duration::from_secs(5), node_b.recv())
        .await
        .expect("B should receive A's opening message")
        .expect("channel open");
    assert_eq!(from, node_a.node_id());
    assert_eq!(plaintext, b"hello");

    node_b.send(&node_a.node_id(), b"world").await.expect("B replies to A");
    let (from, plaintext) = tokio::time::timeout(Duration::from_secs(5), node_a.recv())
        .await
        .expect("A should receive B's reply")
        .expect("channel open");
    assert_eq!(from, node_b.node_id());
    assert_eq!(plaintext, b"world");
}

/// A WELCOME carries the responder's known peers, so a freshly connecting
/// node should learn about them without a separate FIND_NODE round trip.
#[tokio::test]
async fn welcome_seeds_the_dialers_routing_table() {
    let addr_b = format!("127.0.0.1:{}", test_port());
    let node_b = spawn_listening_node(&addr_b).await;

    let addr_c = format!("127.0.0.1:{}", test_port());
    let node_c = spawn_listening_node(&addr_c).await;
    let port_c: u16 = addr_c.rsplit(':').next().unwrap().parse().unwrap();
    node_b.connect("127.0.0.1", port_c).await.expect("B connects to C");

    let node_a = Node::new(IdentityStore::generate(), test_paths(), CancellationToken::new());
    let port_b: u16 = addr_b.rsplit(':').next().unwrap().parse().unwrap();
    node_a.connect("127.0.0.1", port_b).await.expect("A connects to B");

    let known = node_a.routing_table().find_closest(&node_c.node_id(), 20).await;
    assert!(known.iter().any(|p| p.node_id == node_c.node_id()), "A should learn about C via B's WELCOME peer list");
}

/// `close` tears down both the connection and the session; a subsequent
/// `send` fails rather than silently succeeding against a stale handle.
#[tokio::test]
async fn close_removes_session_and_connection() {
    let addr_b = format!("127.0.0.1:{}", test_port());
    let node_b = spawn_listening_node(&addr_b).await;
    let node_a = Node::new(IdentityStore::generate(), test_paths(), CancellationToken::new());
    let port_b: u16 = addr_b.rsplit(':').next().unwrap().parse().unwrap();
    node_a.connect("127.0.0.1", port_b).await.unwrap();

    let bundle_b = node_b.bundle().await;
    node_a.begin_session(&bundle_b, b"hi").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), node_b.recv()).await;

    node_a.close(&node_b.node_id()).await;
    let err = node_a.send(&node_b.node_id(), b"too late").await.unwrap_err();
    assert!(matches!(err, veilnet_node::NodeError::NoSession(_)));
}
