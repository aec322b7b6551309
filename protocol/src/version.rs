//! Protocol version management.
//!
//! Handshakes carry `NET_VERSION_BASE + protocol version`. Older peers that
//! predate versioning send an arbitrary value, which maps to `PROTO_BASE`.

pub const NET_VERSION_BASE: u16 = 0x04b5;

/// Largest protocol version offset accepted above the base.
pub const NET_VERSION_RANGE: u16 = 106;

pub const PROTO_BASE: u16 = 0;

/// Peers at or above this version understand explicit sync requests.
pub const PROTO_EXPLICIT_SYNC: u16 = 1;

/// Protocol version spoken by this node.
pub const NET_VERSION: u16 = PROTO_EXPLICIT_SYNC;

/// The `network_version` value this node puts in its handshakes.
pub fn network_version() -> u16 {
    NET_VERSION_BASE + NET_VERSION
}

/// Map a handshake `network_version` to a protocol version.
pub fn to_protocol_version(network_version: u16) -> u16 {
    match network_version.checked_sub(NET_VERSION_BASE) {
        Some(v) if v <= NET_VERSION_RANGE => v,
        _ => PROTO_BASE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_version_round_trips() {
        assert_eq!(to_protocol_version(network_version()), NET_VERSION);
    }

    #[test]
    fn legacy_values_map_to_base() {
        assert_eq!(to_protocol_version(0), PROTO_BASE);
        assert_eq!(to_protocol_version(NET_VERSION_BASE), PROTO_BASE);
        assert_eq!(
            to_protocol_version(NET_VERSION_BASE + NET_VERSION_RANGE + 1),
            PROTO_BASE
        );
    }
}
