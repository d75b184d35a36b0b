//! # Floodmesh - Flood-Relay Messaging Mesh
//!
//! Floodmesh nodes form a mesh over WebSockets and flood every message they
//! receive to every connection they hold:
//!
//! - **Relay**: content-fingerprint dedup plus broadcast, owned by one actor
//! - **Connections**: reconnecting outbound peers and inbound leaf clients,
//!   both driven by the same session loop
//! - **Packets**: an optional signed, versioned envelope producers can put
//!   on the wire; relays never look inside
//! - **Keystore**: Ed25519 keys by author id, used to sign and verify packets
//!
//! ## Architecture
//!
//! The relay uses the **Actor Pattern**: a cheap-to-clone [`Relay`] handle
//! sends commands to a private actor that owns the connection table and the
//! dedup cache, so each check-insert-broadcast step runs without interleaving.
//!
//! ## Security Model
//!
//! - Transport is unauthenticated; anyone who can reach the listener can
//!   inject traffic
//! - Authorship is established end to end by [`Packet::verify`], never by the
//!   relay path
//! - The dedup cache is bounded, evicting oldest fingerprints first
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Listener, peer tasks and graceful shutdown |
//! | `relay` | Dedup cache, connection table, relay actor |
//! | `connection` | WebSocket session loop, reconnect backoff |
//! | `packet` | Signed wire packet codec |
//! | `keystore` | Ed25519 keys per author |
//! | `addr` | Host/port addresses and connection identifiers |
//! | `config` | YAML node configuration |

mod addr;
mod config;
mod connection;
mod keystore;
mod node;
mod packet;
mod relay;

pub use addr::{AddrError, NodeAddr};
pub use config::{NodeConfig, ReconnectPolicy};
pub use connection::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
pub use keystore::{AuthorKey, Keystore, KeystoreError, KEY_LENGTH, SIGNATURE_LENGTH};
pub use node::Node;
pub use packet::{
    Packet, PacketBody, PacketError, MIN_PACKET_LENGTH, PACKET_PREFIX, PROTOCOL_VERSION,
};
pub use relay::{
    fingerprint, DedupCache, Fingerprint, Link, Relay, RelayOutcome, RelayState,
    MAX_KNOWN_FINGERPRINTS, OUTBOUND_QUEUE_DEPTH,
};
