//! The chain collaborator the net layer reads from and pushes into.
//!
//! Block validation, fork choice and transaction execution live behind this
//! trait. The net layer only needs head / irreversible progress, block
//! lookup, and a way to hand over blocks and transactions it received.

use ledgernet_messages::{GoAwayReason, PackedTransaction, SignedBlock};
use ledgernet_types::{BlockId, BlockNum, Digest, PublicKey, Timestamp};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unknown block {0}")]
    UnknownBlock(BlockNum),

    #[error("unlinkable block: {0}")]
    Unlinkable(String),

    #[error("block validation failed: {0}")]
    Validation(String),

    #[error("transaction rejected: {0}")]
    Transaction(String),

    #[error("{0}")]
    Other(String),
}

impl ChainError {
    /// The go-away a peer earns for sending us a block that failed this way.
    /// `None` means the failure is logged but the session survives.
    pub fn go_away_reason(&self) -> Option<GoAwayReason> {
        match self {
            ChainError::Unlinkable(_) => Some(GoAwayReason::Unlinkable),
            ChainError::Validation(_) => Some(GoAwayReason::Validation),
            _ => None,
        }
    }
}

pub trait Chain: Send {
    fn chain_id(&self) -> Digest;

    fn head_block_num(&self) -> BlockNum;
    fn head_block_id(&self) -> BlockId;
    fn head_block_time(&self) -> Timestamp;

    fn last_irreversible_block_num(&self) -> BlockNum;
    fn last_irreversible_block_id(&self) -> BlockId;

    /// Id of our block at `num`. Fails with [`ChainError::UnknownBlock`] when
    /// we hold no block at that height.
    fn get_block_id_for_num(&self, num: BlockNum) -> Result<BlockId, ChainError>;

    fn fetch_block_by_id(&self, id: &BlockId) -> Option<SignedBlock>;
    fn fetch_block_by_number(&self, num: BlockNum) -> Option<SignedBlock>;

    /// Apply a block received from a peer.
    fn push_block(&mut self, block: SignedBlock) -> Result<(), ChainError>;

    /// Validate and admit a transaction received from a peer.
    fn accept_transaction(&mut self, trx: &PackedTransaction) -> Result<(), ChainError>;

    /// Whether `key` belongs to an active block producer.
    fn is_producer_key(&self, key: &PublicKey) -> bool;
}
