//! Integration tests for mesh relay between nodes.
//!
//! Each test builds a small mesh on loopback, attaches plain WebSocket
//! clients as leaves, and checks what those clients observe.

use std::sync::Once;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use floodmesh::{AuthorKey, Keystore, Node, NodeAddr, NodeConfig, Packet, ReconnectPolicy};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const MESSAGE_WAIT: Duration = Duration::from_millis(300);

// =============================================================================
// Helper Functions
// =============================================================================

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("floodmesh=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 20,
        max_delay_ms: 100,
    }
}

fn loopback(port: u16) -> NodeAddr {
    NodeAddr::new("127.0.0.1", port).expect("valid address")
}

async fn start_node(port: u16, peers: Vec<NodeAddr>) -> Node {
    init_tracing();
    let config = NodeConfig::new(loopback(port), peers).with_reconnect(fast_reconnect());
    Node::bind(config).await.expect("bind failed")
}

async fn connect_client(node: &Node) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", node.local_addr()))
        .await
        .expect("client connect failed");
    client
}

async fn wait_for_connections(node: &Node, expected: usize) {
    timeout(TEST_TIMEOUT, async {
        while node.connections().await.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("node never reached {expected} connections"));
}

async fn next_data_frame(client: &mut Client) -> Message {
    loop {
        let frame = timeout(TEST_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if frame.is_text() || frame.is_binary() {
            return frame;
        }
    }
}

async fn assert_silent(client: &mut Client) {
    let extra = timeout(MESSAGE_WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(frame)) if frame.is_text() || frame.is_binary() => return frame,
                Some(Ok(_)) => continue,
                other => panic!("unexpected stream state: {other:?}"),
            }
        }
    })
    .await;
    assert!(extra.is_err(), "received unexpected frame: {extra:?}");
}

/// A peers with B; one leaf client on each.
async fn two_node_mesh() -> (Node, Node, Client, Client) {
    let node_b = start_node(0, Vec::new()).await;
    let node_a = start_node(0, vec![loopback(node_b.local_addr().port())]).await;

    let client_a = connect_client(&node_a).await;
    let client_b = connect_client(&node_b).await;

    wait_for_connections(&node_a, 2).await;
    wait_for_connections(&node_b, 2).await;
    (node_a, node_b, client_a, client_b)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_crosses_mesh_exactly_once() {
    let (node_a, node_b, mut client_a, mut client_b) = two_node_mesh().await;

    client_a.send(Message::text("hello")).await.unwrap();

    assert_eq!(next_data_frame(&mut client_b).await, Message::text("hello"));
    assert_silent(&mut client_b).await;

    // The sender's own connection gets the broadcast too.
    assert_eq!(next_data_frame(&mut client_a).await, Message::text("hello"));
    assert_silent(&mut client_a).await;

    // A saw it from its client and again from B; only one fingerprint.
    assert_eq!(node_a.known_fingerprints().await, 1);
    assert_eq!(node_b.known_fingerprints().await, 1);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn repeated_payload_is_suppressed() {
    let (node_a, node_b, mut client_a, mut client_b) = two_node_mesh().await;

    client_a.send(Message::text("same")).await.unwrap();
    client_a.send(Message::text("same")).await.unwrap();
    client_a.send(Message::binary(b"other".to_vec())).await.unwrap();

    assert_eq!(next_data_frame(&mut client_b).await, Message::text("same"));
    assert_eq!(next_data_frame(&mut client_b).await, Message::binary(b"other".to_vec()));
    assert_silent(&mut client_b).await;

    drop(client_a);
    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn peer_reconnects_after_restart() {
    let node_b = start_node(0, Vec::new()).await;
    let b_port = node_b.local_addr().port();
    let b_identifier = loopback(b_port).identifier();

    let node_a = start_node(0, vec![loopback(b_port)]).await;
    wait_for_connections(&node_a, 1).await;
    assert_eq!(node_a.connections().await, vec![b_identifier.clone()]);

    node_b.shutdown().await;
    drop(node_b);
    wait_for_connections(&node_a, 0).await;

    let node_b = start_node(b_port, Vec::new()).await;
    wait_for_connections(&node_a, 1).await;
    assert_eq!(node_a.connections().await, vec![b_identifier]);

    let mut client_a = connect_client(&node_a).await;
    let mut client_b = connect_client(&node_b).await;
    wait_for_connections(&node_a, 2).await;
    wait_for_connections(&node_b, 2).await;

    client_b.send(Message::text("back again")).await.unwrap();
    assert_eq!(next_data_frame(&mut client_a).await, Message::text("back again"));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn shutdown_with_unreachable_peer_releases_port() {
    // Reserve a port, then free it so nothing is listening there.
    let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let vacant_port = vacant.local_addr().unwrap().port();
    drop(vacant);

    let node = start_node(0, vec![loopback(vacant_port)]).await;
    let addr = node.local_addr();
    let mut client = connect_client(&node).await;
    wait_for_connections(&node, 1).await;

    timeout(TEST_TIMEOUT, node.shutdown())
        .await
        .expect("shutdown hung");
    assert!(node.connections().await.is_empty());

    // The leaf sees the close, and the listener is gone.
    let closed = timeout(TEST_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client never saw the connection close");
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn shutdown_is_not_blocked_by_stalled_reader() {
    let node = start_node(0, Vec::new()).await;

    // Never polled after the handshake, so its socket buffers fill up.
    let _stalled = connect_client(&node).await;
    let sender = connect_client(&node).await;
    wait_for_connections(&node, 2).await;

    let (mut sink, mut stream) = sender.split();
    let drain = tokio::spawn(async move { while let Some(Ok(_)) = stream.next().await {} });

    for i in 0..64u8 {
        let frame = vec![i; 256 * 1024];
        timeout(TEST_TIMEOUT, sink.send(Message::binary(frame)))
            .await
            .expect("send stalled")
            .expect("send failed");
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    timeout(Duration::from_secs(15), node.shutdown())
        .await
        .expect("shutdown blocked by a client that never reads");
    drain.abort();
}

#[tokio::test]
async fn signed_packet_survives_relay() {
    let (node_a, node_b, mut client_a, mut client_b) = two_node_mesh().await;

    let key = AuthorKey::generate();
    let mut signer = Keystore::new();
    signer.add_key("alice", key.clone());
    let mut verifier = Keystore::new();
    verifier.add_key("alice", key.public());

    let mut packet = Packet::new_with("alice", "signed hello", 7, "").unwrap();
    packet.sign(&signer).unwrap();
    client_a
        .send(Message::binary(packet.serialize().unwrap()))
        .await
        .unwrap();

    let frame = next_data_frame(&mut client_b).await;
    assert!(frame.is_binary());
    let received = Packet::deserialize(&frame.into_data()).unwrap();
    assert_eq!(received, packet);
    assert_eq!(received.channel_id(), 7);
    assert_eq!(received.body_text(), Some("signed hello"));
    assert_eq!(received.verify(&verifier).unwrap(), true);

    node_a.shutdown().await;
    node_b.shutdown().await;
}
