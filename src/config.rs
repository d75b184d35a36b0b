//! Node configuration, loaded from YAML:
//!
//! ```yaml
//! listen: {host: 0.0.0.0, port: 9001}
//! peers:
//!   - {host: relay-b.example, port: 9002}
//! reconnect: {initial_delay_ms: 500, max_delay_ms: 30000}
//! ```
//!
//! `relays` is accepted as an alias for `peers`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::addr::NodeAddr;

/// Floor for reconnect delays so a zero setting cannot spin.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen: NodeAddr,
    #[serde(default, alias = "relays")]
    pub peers: Vec<NodeAddr>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl NodeConfig {
    pub fn new(listen: NodeAddr, peers: Vec<NodeAddr>) -> Self {
        Self {
            listen,
            peers,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid node configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("in config file {}", path.display()))
    }
}

/// Exponential backoff between outbound connection attempts.
///
/// The delay starts at `initial_delay_ms`, doubles after each failed or lost
/// connection up to `max_delay_ms`, and resets once a connection succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms).max(MIN_RECONNECT_DELAY)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms).max(self.initial_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_and_peers() {
        let config = NodeConfig::from_yaml_str(
            "listen: {host: 127.0.0.1, port: 9001}\n\
             peers:\n  - {host: localhost, port: 9002}\n  - {host: '::1', port: 9003}\n",
        )
        .unwrap();

        assert_eq!(config.listen, NodeAddr::new("127.0.0.1", 9001).unwrap());
        let ids: Vec<String> = config.peers.iter().map(NodeAddr::identifier).collect();
        assert_eq!(ids, vec!["localhost_9002", "::1_9003"]);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn relays_alias_and_missing_peers() {
        let config = NodeConfig::from_yaml_str(
            "listen: {host: a, port: 1}\nrelays: [{host: b, port: 2}]\n",
        )
        .unwrap();
        assert_eq!(config.peers.len(), 1);

        let lonely = NodeConfig::from_yaml_str("listen: {host: a, port: 1}\n").unwrap();
        assert!(lonely.peers.is_empty());
    }

    #[test]
    fn reconnect_overrides() {
        let config = NodeConfig::from_yaml_str(
            "listen: {host: a, port: 1}\nreconnect: {initial_delay_ms: 0}\n",
        )
        .unwrap();
        assert_eq!(config.reconnect.initial_delay(), MIN_RECONNECT_DELAY);
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(NodeConfig::from_yaml_str("peers: []\n").is_err());
        assert!(NodeConfig::from_yaml_str("listen: {host: '', port: 1}\n").is_err());
        assert!(NodeConfig::from_yaml_str("listen: {host: a, port: 70000}\n").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NodeConfig::load("/nonexistent/floodmesh.yml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }
}
