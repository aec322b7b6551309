//! Signed blocks as carried on the wire.
//!
//! The net layer never validates a block; it only needs the block's id and
//! number, and the ids of the transactions it includes.

use ledgernet_crypto::sha256_multi;
use ledgernet_types::{BlockId, BlockNum, Digest, Signature, Timestamp, TxId};
use serde::{Deserialize, Serialize};

use crate::transaction::PackedTransaction;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub timestamp: Timestamp,
    pub producer: String,
    pub confirmed: u16,
    pub previous: BlockId,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    pub schedule_version: u32,
}

impl BlockHeader {
    /// Height of this block: one past the block it extends.
    pub fn block_num(&self) -> BlockNum {
        self.previous.num().wrapping_add(1)
    }

    /// Block id: header digest with the block number stamped in front.
    pub fn id(&self) -> BlockId {
        let producer_len = (self.producer.len() as u32).to_le_bytes();
        let digest = sha256_multi(&[
            &self.timestamp.as_nanos().to_le_bytes(),
            &producer_len,
            self.producer.as_bytes(),
            &self.confirmed.to_le_bytes(),
            self.previous.as_bytes(),
            self.transaction_mroot.as_bytes(),
            self.action_mroot.as_bytes(),
            &self.schedule_version.to_le_bytes(),
        ]);
        BlockId::from_digest(self.block_num(), digest)
    }
}

/// Outcome a producer recorded for an included transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[default]
    Executed,
    SoftFail,
    HardFail,
    Delayed,
    Expired,
}

/// A receipt either names the transaction by id or carries it in full.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptTrx {
    Id(TxId),
    Packed(PackedTransaction),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub status: TransactionStatus,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
    pub trx: ReceiptTrx,
}

impl TransactionReceipt {
    pub fn id(&self) -> TxId {
        match &self.trx {
            ReceiptTrx::Id(id) => *id,
            ReceiptTrx::Packed(trx) => trx.id(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: Signature,
    pub transactions: Vec<TransactionReceipt>,
}

impl SignedBlock {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    pub fn previous(&self) -> BlockId {
        self.header.previous
    }

    /// Ids of every transaction included in this block, in block order.
    pub fn transaction_ids(&self) -> impl Iterator<Item = TxId> + '_ {
        self.transactions.iter().map(TransactionReceipt::id)
    }
}
