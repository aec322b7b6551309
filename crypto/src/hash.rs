//! SHA-256 hashing for handshake tokens and transaction ids.

use ledgernet_types::{Digest, Timestamp, TxId};
use sha2::{Digest as _, Sha256};

/// Compute the SHA-256 hash of arbitrary data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256_multi(&[data])
}

/// Hash multiple byte slices in sequence (avoids concatenation allocation).
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

pub fn sha256_digest(data: &[u8]) -> Digest {
    Digest::new(sha256(data))
}

/// The handshake token for a given handshake time: `sha256(time_le)`.
pub fn hash_time(time: Timestamp) -> Digest {
    sha256_digest(&time.as_nanos().to_le_bytes())
}

/// Transaction id: `sha256(expiration_le || packed_trx)`.
pub fn tx_id(expiration: Timestamp, packed_trx: &[u8]) -> TxId {
    TxId::new(sha256_multi(&[
        &expiration.as_nanos().to_le_bytes(),
        packed_trx,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let h = sha256(b"abc");
        assert_eq!(h[0], 0xba);
        assert_eq!(h[31], 0xad);
    }

    #[test]
    fn sha256_multi_equivalent() {
        let single = sha256(b"helloworld");
        let multi = sha256_multi(&[b"hello", b"world"]);
        assert_eq!(single, multi);
    }

    #[test]
    fn hash_time_depends_on_time() {
        let a = hash_time(Timestamp::from_nanos(1));
        let b = hash_time(Timestamp::from_nanos(2));
        assert_ne!(a, b);
        assert_eq!(a, hash_time(Timestamp::from_nanos(1)));
        assert!(!a.is_zero());
    }

    #[test]
    fn tx_id_covers_expiration() {
        let a = tx_id(Timestamp::from_secs(10), b"trx");
        let b = tx_id(Timestamp::from_secs(11), b"trx");
        assert_ne!(a, b);
    }
}
