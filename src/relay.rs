//! # Flood Relay with Actor-based Architecture
//!
//! This module owns the two pieces of shared state of a node: the
//! connection table and the dedup cache. Both live inside a single actor
//! task, so the check, insert and broadcast sequence for one message runs
//! without interleaving with any other relay step.
//!
//! # Architecture
//!
//! - `Relay`: the public handle (cheap to clone, sends commands to the actor)
//! - `RelayActor`: owns a [`RelayState`], processes commands sequentially
//! - `Command`: commands sent from handles to the actor
//!
//! # Relay Step
//!
//! 1. Fingerprint the raw payload (BLAKE3, truncated to 128 bits)
//! 2. Already in the dedup cache: drop it
//! 3. Otherwise record the fingerprint and enqueue the frame on every
//!    connection in the table, the originating one included
//!
//! The fingerprint only suppresses loops. It has nothing to do with packet
//! signatures, and the relay never parses packet contents.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of fingerprints remembered by the dedup cache.
pub const MAX_KNOWN_FINGERPRINTS: usize = 1024 * 1024;

/// Depth of each connection's outbound frame queue.
/// Frames broadcast to a connection whose queue is full are dropped for it.
pub const OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Depth of the command queue feeding the relay actor.
const COMMAND_QUEUE_DEPTH: usize = 4096;

/// 128-bit content fingerprint of a relayed payload.
pub type Fingerprint = [u8; 16];

/// Fingerprint of a raw payload, used only for loop suppression.
pub fn fingerprint(payload: &[u8]) -> Fingerprint {
    let digest = blake3::hash(payload);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    out
}

/// Payload bytes of a relayable frame. Control frames are never relayed.
pub fn relay_payload(frame: &Message) -> Option<&[u8]> {
    match frame {
        Message::Text(text) => Some(text.as_bytes()),
        Message::Binary(data) => Some(data.as_ref()),
        _ => None,
    }
}

// ============================================================================
// Dedup Cache
// ============================================================================

/// Bounded FIFO set of fingerprints.
///
/// Backed by an `LruCache` that is only ever probed with `contains`, which
/// does not touch recency, so eviction order is insertion order.
pub struct DedupCache {
    seen: LruCache<Fingerprint, ()>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Record a fingerprint. Returns the evicted oldest entry, if any.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> Option<Fingerprint> {
        match self.seen.push(fingerprint, ()) {
            Some((evicted, ())) if evicted != fingerprint => Some(evicted),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.seen.cap().get()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(MAX_KNOWN_FINGERPRINTS)
    }
}

// ============================================================================
// Connection Table
// ============================================================================

/// Sending half of a live connection, as stored in the table.
///
/// `serial` is unique per registration so that a replaced connection
/// closing late cannot remove its replacement.
#[derive(Clone, Debug)]
pub struct Link {
    pub serial: u64,
    pub outbound: mpsc::Sender<Message>,
}

/// Result of one relay step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Fingerprint already known; nothing was sent.
    Duplicate,
    /// Frame was enqueued on `delivered` connections.
    Broadcast { delivered: usize },
    /// Control frame; not relayed.
    Ignored,
}

/// Connection table plus dedup cache. Owned by the relay actor.
#[derive(Default)]
pub struct RelayState {
    connections: HashMap<String, Link>,
    known: DedupCache,
}

impl RelayState {
    pub fn with_capacity(known_fingerprints: usize) -> Self {
        Self {
            connections: HashMap::new(),
            known: DedupCache::new(known_fingerprints),
        }
    }

    /// Register `link` under `identifier`, replacing any previous entry.
    pub fn register(&mut self, identifier: String, link: Link) -> Option<Link> {
        self.connections.insert(identifier, link)
    }

    /// Remove `identifier` if it is still held by the registration `serial`.
    pub fn deregister(&mut self, identifier: &str, serial: u64) -> bool {
        match self.connections.get(identifier) {
            Some(link) if link.serial == serial => {
                self.connections.remove(identifier);
                true
            }
            _ => false,
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn known_fingerprints(&self) -> usize {
        self.known.len()
    }

    pub fn relay(&mut self, frame: Message) -> RelayOutcome {
        let Some(payload) = relay_payload(&frame) else {
            return RelayOutcome::Ignored;
        };
        let fp = fingerprint(payload);
        if self.known.contains(&fp) {
            trace!(fingerprint = %hex::encode(fp), "duplicate suppressed");
            return RelayOutcome::Duplicate;
        }
        self.known.insert(fp);

        let mut delivered = 0;
        for (identifier, link) in &self.connections {
            match link.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = %identifier, "outbound queue full, dropping frame");
                }
                // The connection task is exiting and will deregister itself.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        trace!(fingerprint = %hex::encode(fp), delivered, "relayed");
        RelayOutcome::Broadcast { delivered }
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Register(String, Link),
    Deregister(String, u64),
    Relay(Message),
    Connections(oneshot::Sender<Vec<String>>),
    KnownFingerprints(oneshot::Sender<usize>),
    Quit,
}

// ============================================================================
// Relay Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Relay {
    cmd_tx: mpsc::Sender<Command>,
}

impl Relay {
    /// Spawn the relay actor with the default dedup bound.
    pub fn spawn() -> Self {
        Self::spawn_with_state(RelayState::default())
    }

    pub fn spawn_with_state(state: RelayState) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = RelayActor { state };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub async fn register(&self, identifier: String, link: Link) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Register(identifier, link))
            .await
            .map_err(|_| anyhow::anyhow!("relay actor closed"))
    }

    pub async fn deregister(&self, identifier: String, serial: u64) {
        let _ = self.cmd_tx.send(Command::Deregister(identifier, serial)).await;
    }

    /// Submit a received frame for relay. Order per caller is preserved.
    pub async fn relay(&self, frame: Message) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::Relay(frame))
            .await
            .map_err(|_| anyhow::anyhow!("relay actor closed"))
    }

    /// Identifiers currently in the connection table, sorted.
    pub async fn connections(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Connections(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn known_fingerprints(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::KnownFingerprints(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Relay Actor (owns state)
// ============================================================================

struct RelayActor {
    state: RelayState,
}

impl RelayActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Register(identifier, link) => {
                    if self.state.register(identifier.clone(), link).is_some() {
                        debug!(connection = %identifier, "replaced existing connection entry");
                    }
                }
                Command::Deregister(identifier, serial) => {
                    if !self.state.deregister(&identifier, serial) {
                        trace!(connection = %identifier, serial, "stale deregistration ignored");
                    }
                }
                Command::Relay(frame) => {
                    self.state.relay(frame);
                }
                Command::Connections(reply) => {
                    let _ = reply.send(self.state.identifiers());
                }
                Command::KnownFingerprints(reply) => {
                    let _ = reply.send(self.state.known_fingerprints());
                }
                Command::Quit => {
                    debug!("relay actor quitting");
                    return;
                }
            }
        }
        debug!("relay handles dropped, actor quitting");
    }
}
