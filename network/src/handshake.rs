//! Handshake population, validation and peer authentication.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use ledgernet_crypto::{hash_time, sign_digest, verify_digest};
use ledgernet_messages::HandshakeMessage;
use ledgernet_protocol::{check_handshake, network_version};
use ledgernet_types::{Digest, KeyPair, PublicKey, Signature, Timestamp};
use tracing::{debug, warn};

use crate::chain::Chain;
use crate::NetworkError;

/// Which peers may hold a session with us.
///
/// A bitmask: `PRODUCERS` and `SPECIFIED` may be combined. `NONE` refuses
/// everyone and `ANY` admits everyone.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AllowedConnections(u8);

impl AllowedConnections {
    pub const NONE: Self = Self(0);
    pub const PRODUCERS: Self = Self(1);
    pub const SPECIFIED: Self = Self(2);
    pub const ANY: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    fn needs_key(self) -> bool {
        self.0 & (Self::PRODUCERS.0 | Self::SPECIFIED.0) != 0
    }

    /// Parse the configured list (`"any"`, `"producers"`, `"specified"`,
    /// `"none"`). `"none"` cannot be combined with anything else.
    pub fn from_config(entries: &[String]) -> Result<Self, NetworkError> {
        let mut allowed = Self::NONE;
        let mut saw_none = false;
        for entry in entries {
            match entry.as_str() {
                "any" => allowed = allowed.union(Self::ANY),
                "producers" => allowed = allowed.union(Self::PRODUCERS),
                "specified" => allowed = allowed.union(Self::SPECIFIED),
                "none" => saw_none = true,
                other => {
                    return Err(NetworkError::InvalidConfig(format!(
                        "unknown allowed-connection value '{other}'"
                    )))
                }
            }
        }
        if saw_none && !allowed.is_none() {
            return Err(NetworkError::InvalidConfig(
                "allowed-connection 'none' cannot be combined with other values".into(),
            ));
        }
        Ok(allowed)
    }
}

impl fmt::Debug for AllowedConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let names: Vec<&str> = [
            (Self::ANY, "any"),
            (Self::PRODUCERS, "producers"),
            (Self::SPECIFIED, "specified"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        f.write_str(&names.join("|"))
    }
}

/// Our side of every handshake: identity, signing keys and admission policy.
pub struct Handshaker {
    pub node_id: Digest,
    /// Address we advertise, before the node-id suffix is appended.
    pub server_address: String,
    pub agent: String,
    pub os: String,
    /// Keys we can sign handshakes with. The first one is advertised.
    pub keys: Vec<KeyPair>,
    pub allowed_peers: BTreeSet<PublicKey>,
    pub allowed_connections: AllowedConnections,
    /// Largest tolerated age of a peer's handshake timestamp.
    pub peer_auth_interval: Duration,
    /// Refuse peers speaking a different protocol version.
    pub network_version_match: bool,
}

impl Handshaker {
    pub fn new(node_id: Digest, server_address: impl Into<String>) -> Self {
        Self {
            node_id,
            server_address: server_address.into(),
            agent: "\"ledgernet\"".into(),
            os: std::env::consts::OS.into(),
            keys: Vec::new(),
            allowed_peers: BTreeSet::new(),
            allowed_connections: AllowedConnections::ANY,
            peer_auth_interval: Duration::from_secs(1),
            network_version_match: false,
        }
    }

    /// `"<server address> - <first 7 hex chars of node id>"`.
    pub fn p2p_address(&self) -> String {
        format!("{} - {}", self.server_address, self.node_id.short_hex(7))
    }

    pub fn authentication_key(&self) -> PublicKey {
        self.keys.first().map(|k| k.public).unwrap_or(PublicKey::ZERO)
    }

    fn sign(&self, token: &Digest) -> Signature {
        match self.keys.first() {
            Some(kp) => sign_digest(token, &kp.private),
            None => Signature::ZERO,
        }
    }

    /// Build a handshake describing our current chain view.
    pub fn populate(&self, chain: &dyn Chain, now: Timestamp, generation: u16) -> HandshakeMessage {
        let token = hash_time(now);
        let sig = self.sign(&token);
        HandshakeMessage {
            network_version: network_version(),
            chain_id: chain.chain_id(),
            node_id: self.node_id,
            key: self.authentication_key(),
            time: now,
            // An unsigned handshake carries no token.
            token: if sig.is_zero() { Digest::ZERO } else { token },
            sig,
            p2p_address: self.p2p_address(),
            last_irreversible_block_num: chain.last_irreversible_block_num(),
            last_irreversible_block_id: chain.last_irreversible_block_id(),
            head_num: chain.head_block_num(),
            head_id: chain.head_block_id(),
            os: self.os.clone(),
            agent: self.agent.clone(),
            generation,
        }
    }

    fn holds_private_key(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.public == *key)
    }

    /// Admission check run on the first handshake of a session.
    pub fn authenticate_peer(&self, msg: &HandshakeMessage, chain: &dyn Chain, now: Timestamp) -> bool {
        let allowed = self.allowed_connections;
        if allowed.is_none() {
            return false;
        }
        if allowed == AllowedConnections::ANY {
            return true;
        }
        if allowed.needs_key()
            && !self.allowed_peers.contains(&msg.key)
            && !self.holds_private_key(&msg.key)
            && !chain.is_producer_key(&msg.key)
        {
            warn!(peer = %msg.p2p_address, key = %msg.key, "handshake with an unauthorized key");
            return false;
        }
        if msg.time.elapsed_until(now) > self.peer_auth_interval {
            warn!(
                peer = %msg.p2p_address,
                interval_ms = self.peer_auth_interval.as_millis() as u64,
                "handshake timestamp too old"
            );
            return false;
        }
        if !msg.sig.is_zero() && !msg.token.is_zero() {
            if msg.token != hash_time(msg.time) {
                warn!(peer = %msg.p2p_address, "handshake token does not match time");
                return false;
            }
            if !verify_digest(&msg.token, &msg.sig, &msg.key) {
                warn!(peer = %msg.p2p_address, "handshake signature does not verify");
                return false;
            }
        } else if allowed.needs_key() {
            debug!(peer = %msg.p2p_address, "unsigned handshake but only authenticated peers are accepted");
            return false;
        }
        true
    }
}

/// Structural validity of an inbound handshake.
pub fn is_valid(msg: &HandshakeMessage) -> bool {
    match check_handshake(msg) {
        Ok(()) => true,
        Err(e) => {
            warn!(peer = %msg.p2p_address, error = %e, "invalid handshake");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allowed_connections() {
        let parse = |v: &[&str]| {
            AllowedConnections::from_config(&v.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };
        assert_eq!(parse(&["any"]).unwrap(), AllowedConnections::ANY);
        let both = parse(&["producers", "specified"]).unwrap();
        assert!(both.contains(AllowedConnections::PRODUCERS));
        assert!(both.contains(AllowedConnections::SPECIFIED));
        assert!(!both.contains(AllowedConnections::ANY));
        assert!(parse(&["none"]).unwrap().is_none());
        assert!(matches!(parse(&["none", "any"]), Err(NetworkError::InvalidConfig(_))));
        assert!(matches!(
            parse(&["everyone"]),
            Err(NetworkError::InvalidConfig(m)) if m.contains("everyone")
        ));
        assert_eq!(format!("{both:?}"), "producers|specified");
    }

    #[test]
    fn p2p_address_carries_node_id_prefix() {
        let hs = Handshaker::new(Digest::new([0xAB; 32]), "10.0.0.1:9876");
        assert_eq!(hs.p2p_address(), "10.0.0.1:9876 - abababa");
    }
}
