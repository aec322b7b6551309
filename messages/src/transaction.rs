//! Packed transactions as relayed between peers.

use ledgernet_crypto::tx_id;
use ledgernet_types::{Signature, Timestamp, TxId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

/// A transaction in the form producers and relays pass around: opaque
/// serialized body plus the signatures authorizing it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedTransaction {
    pub signatures: Vec<Signature>,
    pub compression: Compression,
    pub packed_context_free_data: Vec<u8>,
    pub packed_trx: Vec<u8>,
    /// Once passed, the transaction can no longer be included in a block.
    pub expiration: Timestamp,
}

impl PackedTransaction {
    pub fn new(packed_trx: Vec<u8>, expiration: Timestamp) -> Self {
        Self {
            packed_trx,
            expiration,
            ..Default::default()
        }
    }

    pub fn id(&self) -> TxId {
        tx_id(self.expiration, &self.packed_trx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_do_not_change_id() {
        let unsigned = PackedTransaction::new(b"body".to_vec(), Timestamp::from_secs(7));
        let mut signed = unsigned.clone();
        signed.signatures.push(Signature([3; 64]));
        assert_eq!(unsigned.id(), signed.id());
    }
}
