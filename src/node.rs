//! # Relay Node
//!
//! A [`Node`] ties the pieces together: one listening socket for inbound
//! connections, one reconnecting task per configured peer, and the relay
//! actor that owns the connection table and dedup cache.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = NodeConfig::load("node.yml")?;
//! let node = Node::bind(config).await?;
//! node.run_until(tokio::signal::ctrl_c()).await;
//! ```
//!
//! ## Shutdown
//!
//! [`Node::shutdown`] flips a `watch` flag observed by every task. Peer tasks
//! stop reconnecting and close their sessions, the accept loop drops the
//! listener and waits for its inbound sessions, and only then is the relay
//! actor stopped. Every session deregisters itself on the way out, so the
//! connection table is empty once shutdown returns.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::addr::NodeAddr;
use crate::config::NodeConfig;
use crate::connection::{maintain_peer, serve_inbound, shutdown_requested};
use crate::relay::Relay;

/// Pause after a failed `accept` so a persistent error (e.g. EMFILE) cannot spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// How long inbound sessions get to finish after shutdown before being aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct Node {
    config: NodeConfig,
    local_addr: SocketAddr,
    relay: Relay,
    shutdown_tx: watch::Sender<bool>,
    peer_tasks: Mutex<JoinSet<()>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bind the listener and start the relay, the accept loop and one task
    /// per configured peer.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let listen = &config.listen;
        let listener = TcpListener::bind((listen.host(), listen.port()))
            .await
            .with_context(|| format!("failed to bind listener on {listen}"))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let relay = Relay::spawn();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut peer_tasks = JoinSet::new();
        for peer in &config.peers {
            peer_tasks.spawn(maintain_peer(
                peer.clone(),
                relay.clone(),
                config.reconnect,
                shutdown_rx.clone(),
            ));
        }

        let accept = tokio::spawn(accept_loop(listener, relay.clone(), shutdown_rx));

        Ok(Self {
            config,
            local_addr,
            relay,
            shutdown_tx,
            peer_tasks: Mutex::new(peer_tasks),
            listener: Mutex::new(Some(accept)),
        })
    }

    /// Address the listener is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listen_address(&self) -> &NodeAddr {
        &self.config.listen
    }

    pub fn peers(&self) -> &[NodeAddr] {
        &self.config.peers
    }

    /// Identifiers currently in the connection table, sorted.
    pub async fn connections(&self) -> Vec<String> {
        self.relay.connections().await
    }

    pub async fn known_fingerprints(&self) -> usize {
        self.relay.known_fingerprints().await
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop all tasks and wait until the listener is released.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let mut peer_tasks = self.peer_tasks.lock().await;
        while let Some(joined) = peer_tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "peer task failed");
            }
        }
        drop(peer_tasks);

        if let Some(accept) = self.listener.lock().await.take() {
            if let Err(e) = accept.await {
                warn!(error = %e, "accept loop failed");
            }
        }

        self.relay.quit().await;
        debug!("node shut down");
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until<F>(&self, signal: F)
    where
        F: Future,
    {
        signal.await;
        info!("shutdown requested");
        self.shutdown().await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Tasks observe the flag and wind down on their own.
        self.shutdown_tx.send_replace(true);
    }
}

/// Sleep for `delay`. Returns `true` early if shutdown is requested.
async fn pause_unless_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn accept_loop(listener: TcpListener, relay: Relay, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "incoming connection");
                    connections.spawn(serve_inbound(stream, remote, relay.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    if pause_unless_shutdown(&mut shutdown, ACCEPT_ERROR_DELAY).await {
                        break;
                    }
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "inbound connections did not close in time, aborting");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    info!("listener closed");
}
