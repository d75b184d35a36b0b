//! # WebSocket Connections
//!
//! Every connection, inbound or outbound, runs the same session loop:
//! register a [`Link`] with the relay, then multiplex
//!
//! - frames received from the socket, handed to the relay
//! - frames queued by the relay, written to the socket
//! - the node's shutdown signal
//!
//! until the socket closes, errors, or the node shuts down. The session
//! always deregisters before returning.
//!
//! Outbound peers wrap the session in a reconnect loop with exponential
//! backoff that only ends on shutdown. Inbound connections run one session
//! and end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::addr::NodeAddr;
use crate::config::ReconnectPolicy;
use crate::relay::{relay_payload, Link, Relay, OUTBOUND_QUEUE_DEPTH};

/// Upper bound for one outbound TCP + WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for an inbound WebSocket upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for sending a close frame on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Outcome of one read from the socket.
#[derive(Debug)]
pub(crate) enum Received {
    Message(Message),
    Closed,
    Error(String),
}

/// Why a session loop ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Shutdown,
    Closed,
    Error(String),
}

/// Resolves once shutdown has been requested or the node is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn receive<S>(stream: &mut S) -> Received
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match stream.next().await {
        Some(Ok(Message::Close(_))) | None => Received::Closed,
        Some(Ok(frame)) => Received::Message(frame),
        Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Received::Closed,
        Some(Err(e)) => Received::Error(e.to_string()),
    }
}

/// Run one connection until it closes or the node shuts down.
pub(crate) async fn run_session<S>(
    ws: WebSocketStream<S>,
    identifier: &str,
    relay: &Relay,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let link = Link {
        serial,
        outbound: outbound_tx,
    };
    if let Err(e) = relay.register(identifier.to_string(), link).await {
        return SessionEnd::Error(e.to_string());
    }

    let (mut sink, mut stream) = ws.split();
    let end = loop {
        tokio::select! {
            _ = shutdown_requested(shutdown) => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                break SessionEnd::Shutdown;
            }
            Some(frame) = outbound.recv() => {
                // Blocks for as long as the peer is not reading.
                tokio::select! {
                    sent = sink.send(frame) => {
                        if let Err(e) = sent {
                            break SessionEnd::Error(e.to_string());
                        }
                    }
                    _ = shutdown_requested(shutdown) => {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                        break SessionEnd::Shutdown;
                    }
                }
            }
            received = receive(&mut stream) => match received {
                Received::Message(frame) => {
                    if relay_payload(&frame).is_none() {
                        continue;
                    }
                    if let Err(e) = relay.relay(frame).await {
                        break SessionEnd::Error(e.to_string());
                    }
                }
                Received::Closed => break SessionEnd::Closed,
                Received::Error(reason) => break SessionEnd::Error(reason),
            },
        }
    };

    relay.deregister(identifier.to_string(), serial).await;
    end
}

// ============================================================================
// Outbound peers
// ============================================================================

/// Delay schedule for reconnect attempts.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_delay(),
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.max_delay());
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.policy.initial_delay();
    }
}

/// Keep a connection to `peer` alive until shutdown.
pub(crate) async fn maintain_peer(
    peer: NodeAddr,
    relay: Relay,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let identifier = peer.identifier();
    let uri = peer.uri();
    let mut backoff = Backoff::new(policy);
    info!(peer = %identifier, "attempting to connect to peer");

    loop {
        let attempt = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            attempt = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(uri.as_str())) => attempt,
        };

        match attempt {
            Ok(Ok((ws, _response))) => {
                info!(peer = %identifier, "connected to peer");
                backoff.reset();
                match run_session(ws, &identifier, &relay, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Closed => warn!(peer = %identifier, "lost connection to peer"),
                    SessionEnd::Error(reason) => {
                        warn!(peer = %identifier, %reason, "lost connection to peer")
                    }
                }
            }
            Ok(Err(e)) => debug!(peer = %identifier, error = %e, "connect attempt failed"),
            Err(_) => debug!(peer = %identifier, "connect attempt timed out"),
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(peer = %identifier, "peer task cancelled");
}

// ============================================================================
// Inbound connections
// ============================================================================

/// Upgrade an accepted TCP stream and relay on it until it closes.
pub(crate) async fn serve_inbound(
    stream: TcpStream,
    remote: SocketAddr,
    relay: Relay,
    mut shutdown: watch::Receiver<bool>,
) {
    let identifier = NodeAddr::from(remote).identifier();

    let handshake = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => return,
        handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)) => handshake,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(connection = %identifier, error = %e, "websocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(connection = %identifier, "websocket handshake timed out");
            return;
        }
    };

    info!(connection = %identifier, "accepted connection");
    match run_session(ws, &identifier, &relay, &mut shutdown).await {
        SessionEnd::Shutdown => debug!(connection = %identifier, "closed on shutdown"),
        SessionEnd::Closed => info!(connection = %identifier, "lost connection"),
        SessionEnd::Error(reason) => info!(connection = %identifier, %reason, "lost connection"),
    }
}
