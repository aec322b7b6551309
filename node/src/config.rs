//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use ledgernet_crypto::keypair_from_private;
use ledgernet_network::{AllowedConnections, Handshaker, NetSettings};
use ledgernet_protocol::MAX_MESSAGE_SIZE;
use ledgernet_types::{parse_hex_array, Digest, KeyPair, PrivateKey, PublicKey};

use crate::NodeError;

/// Configuration for a ledgernet node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the listener binds to.
    #[serde(default = "default_listen_endpoint")]
    pub listen_endpoint: String,

    /// Address advertised in handshakes. Empty means the bound listener
    /// address.
    #[serde(default)]
    pub server_address: String,

    /// Peers dialed on startup and redialed by the connection monitor.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Any of "any", "producers", "specified", or just "none".
    #[serde(default = "default_allowed_connections")]
    pub allowed_connections: Vec<String>,

    /// Hex public keys admitted under "specified".
    #[serde(default)]
    pub allowed_peers: Vec<String>,

    /// Handshake signing keys as `PUBLIC_HEX=PRIVATE_HEX`.
    #[serde(default)]
    pub peer_private_keys: Vec<String>,

    /// Inbound session limit, 0 for unlimited.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_max_nodes_per_host")]
    pub max_nodes_per_host: usize,

    #[serde(default = "default_connection_cleanup_period_secs")]
    pub connection_cleanup_period_secs: u64,

    #[serde(default = "default_sync_fetch_span")]
    pub sync_fetch_span: u32,

    #[serde(default = "default_max_implicit_request")]
    pub max_implicit_request: usize,

    #[serde(default)]
    pub network_version_match: bool,

    #[serde(default = "default_txn_expiry_period_secs")]
    pub txn_expiry_period_secs: u64,

    /// How long a sync chunk or fetch may stay unanswered.
    #[serde(default = "default_resp_expected_period_secs")]
    pub resp_expected_period_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Largest tolerated age of a signed peer handshake.
    #[serde(default = "default_peer_authentication_interval_secs")]
    pub peer_authentication_interval_secs: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub enable_metrics: bool,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen_endpoint() -> String {
    "0.0.0.0:9876".to_string()
}

fn default_agent_name() -> String {
    "\"ledgernet\"".to_string()
}

fn default_allowed_connections() -> Vec<String> {
    vec!["any".to_string()]
}

fn default_max_clients() -> usize {
    25
}

fn default_max_nodes_per_host() -> usize {
    1
}

fn default_connection_cleanup_period_secs() -> u64 {
    30
}

fn default_sync_fetch_span() -> u32 {
    100
}

fn default_max_implicit_request() -> usize {
    1500
}

fn default_txn_expiry_period_secs() -> u64 {
    3
}

fn default_resp_expected_period_secs() -> u64 {
    5
}

fn default_keepalive_interval_secs() -> u64 {
    32
}

fn default_peer_authentication_interval_secs() -> u64 {
    1
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn net_settings(&self) -> NetSettings {
        NetSettings {
            sync_fetch_span: self.sync_fetch_span.max(1),
            max_implicit_request: self.max_implicit_request,
            max_clients: self.max_clients,
            max_nodes_per_host: self.max_nodes_per_host,
        }
    }

    /// Build our handshake identity. `server_address` is used when the
    /// config does not name one.
    pub fn handshaker(&self, node_id: Digest, server_address: &str) -> Result<Handshaker, NodeError> {
        let advertised = if self.server_address.is_empty() {
            server_address
        } else {
            self.server_address.as_str()
        };
        let mut handshaker = Handshaker::new(node_id, advertised);
        handshaker.agent = self.agent_name.clone();
        handshaker.allowed_connections =
            AllowedConnections::from_config(&self.allowed_connections)?;
        handshaker.allowed_peers = self
            .allowed_peers
            .iter()
            .map(|s| parse_public_key(s))
            .collect::<Result<BTreeSet<_>, _>>()?;
        handshaker.keys = self
            .peer_private_keys
            .iter()
            .map(|s| parse_key_pair(s))
            .collect::<Result<Vec<_>, _>>()?;
        handshaker.peer_auth_interval = Duration::from_secs(self.peer_authentication_interval_secs);
        handshaker.network_version_match = self.network_version_match;
        Ok(handshaker)
    }
}

fn parse_public_key(s: &str) -> Result<PublicKey, NodeError> {
    parse_hex_array::<32>(s)
        .map(PublicKey)
        .map_err(|e| NodeError::Config(format!("allowed peer key: {e}")))
}

/// `PUBLIC_HEX=PRIVATE_HEX`; the public half must match the private one.
fn parse_key_pair(s: &str) -> Result<KeyPair, NodeError> {
    let (public, private) = s
        .split_once('=')
        .ok_or_else(|| NodeError::Config(format!("key pair '{s}' is not PUBLIC=PRIVATE")))?;
    let public = parse_public_key(public)?;
    let private = parse_hex_array::<32>(private)
        .map(PrivateKey)
        .map_err(|e| NodeError::Config(format!("peer private key: {e}")))?;
    let pair = keypair_from_private(private);
    if pair.public != public {
        return Err(NodeError::Config(
            "peer private key does not match its public key".into(),
        ));
    }
    Ok(pair)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_endpoint: default_listen_endpoint(),
            server_address: String::new(),
            peers: Vec::new(),
            agent_name: default_agent_name(),
            allowed_connections: default_allowed_connections(),
            allowed_peers: Vec::new(),
            peer_private_keys: Vec::new(),
            max_clients: default_max_clients(),
            max_nodes_per_host: default_max_nodes_per_host(),
            connection_cleanup_period_secs: default_connection_cleanup_period_secs(),
            sync_fetch_span: default_sync_fetch_span(),
            max_implicit_request: default_max_implicit_request(),
            network_version_match: false,
            txn_expiry_period_secs: default_txn_expiry_period_secs(),
            resp_expected_period_secs: default_resp_expected_period_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            peer_authentication_interval_secs: default_peer_authentication_interval_secs(),
            max_message_size: default_max_message_size(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgernet_crypto::keypair_from_seed;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = NodeConfig::from_toml_str(&toml_str).expect("should parse");
        assert_eq!(parsed.listen_endpoint, config.listen_endpoint);
        assert_eq!(parsed.max_clients, config.max_clients);
        assert_eq!(parsed.allowed_connections, config.allowed_connections);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config = NodeConfig::from_toml_str("").expect("empty toml should use defaults");
        assert_eq!(config.listen_endpoint, "0.0.0.0:9876");
        assert_eq!(config.max_clients, 25);
        assert_eq!(config.max_nodes_per_host, 1);
        assert_eq!(config.sync_fetch_span, 100);
        assert_eq!(config.max_implicit_request, 1500);
        assert_eq!(config.keepalive_interval_secs, 32);
        assert_eq!(config.resp_expected_period_secs, 5);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.log_format, "human");
    }

    #[test]
    fn partial_toml_overrides() {
        let toml = r#"
            peers = ["10.0.0.1:9876", "10.0.0.2:9876"]
            max_clients = 0
            allowed_connections = ["producers", "specified"]
        "#;
        let config = NodeConfig::from_toml_str(toml).expect("should parse");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.max_clients, 0);
        assert_eq!(config.log_level, "info");

        let handshaker = config.handshaker(Digest::ZERO, "127.0.0.1:1").unwrap();
        assert!(handshaker.allowed_connections.contains(AllowedConnections::PRODUCERS));
        assert!(!handshaker.allowed_connections.contains(AllowedConnections::ANY));
    }

    #[test]
    fn missing_file_returns_config_error() {
        let result = NodeConfig::from_toml_file("/nonexistent/ledgernet.toml");
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "sync_fetch_span = 25\n").unwrap();
        let config = NodeConfig::from_toml_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.net_settings().sync_fetch_span, 25);
    }

    #[test]
    fn server_address_falls_back_to_listener() {
        let config = NodeConfig::default();
        let handshaker = config.handshaker(Digest::ZERO, "127.0.0.1:4000").unwrap();
        assert_eq!(handshaker.server_address, "127.0.0.1:4000");

        let config = NodeConfig {
            server_address: "node.example:9876".into(),
            ..NodeConfig::default()
        };
        let handshaker = config.handshaker(Digest::ZERO, "127.0.0.1:4000").unwrap();
        assert_eq!(handshaker.server_address, "node.example:9876");
    }

    #[test]
    fn key_pairs_must_match() {
        let kp = keypair_from_seed(&[7u8; 32]);
        let good = format!("{}={}", hex::encode(&kp.public.0), hex::encode(&kp.private.0));
        let config = NodeConfig {
            peer_private_keys: vec![good],
            allowed_peers: vec![hex::encode(&kp.public.0)],
            ..NodeConfig::default()
        };
        let handshaker = config.handshaker(Digest::ZERO, "").unwrap();
        assert_eq!(handshaker.authentication_key(), kp.public);
        assert!(handshaker.allowed_peers.contains(&kp.public));

        let other = keypair_from_seed(&[8u8; 32]);
        let bad = format!("{}={}", hex::encode(&other.public.0), hex::encode(&kp.private.0));
        let config = NodeConfig {
            peer_private_keys: vec![bad],
            ..NodeConfig::default()
        };
        assert!(matches!(config.handshaker(Digest::ZERO, ""), Err(NodeError::Config(_))));
    }

    #[test]
    fn unknown_allowed_connection_is_rejected() {
        let config = NodeConfig {
            allowed_connections: vec!["everyone".into()],
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.handshaker(Digest::ZERO, ""),
            Err(NodeError::Network(_))
        ));
    }
}
