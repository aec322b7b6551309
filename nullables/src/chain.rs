//! Nullable chain: an in-memory block list for testing.

use std::collections::BTreeSet;

use ledgernet_messages::{
    BlockHeader, PackedTransaction, ReceiptTrx, SignedBlock, TransactionReceipt,
    TransactionStatus,
};
use ledgernet_network::{Chain, ChainError};
use ledgernet_types::{BlockId, BlockNum, Digest, PublicKey, Timestamp, TxId};

/// A linear chain held in memory.
///
/// Blocks are built deterministically from their height and producer name,
/// so two `NullChain`s built the same way share the same block ids.
pub struct NullChain {
    chain_id: Digest,
    blocks: Vec<SignedBlock>,
    lib: BlockNum,
    producer_keys: BTreeSet<PublicKey>,
    rejected_txns: BTreeSet<TxId>,
    accepted_txns: Vec<TxId>,
    fail_next_push: Option<ChainError>,
}

impl NullChain {
    pub fn new(chain_id: Digest) -> Self {
        Self {
            chain_id,
            blocks: Vec::new(),
            lib: 0,
            producer_keys: BTreeSet::new(),
            rejected_txns: BTreeSet::new(),
            accepted_txns: Vec::new(),
            fail_next_push: None,
        }
    }

    /// A chain of `head` blocks from producer `"alice"`, irreversible
    /// through `lib`.
    pub fn with_blocks(chain_id: Digest, head: BlockNum, lib: BlockNum) -> Self {
        let mut chain = Self::new(chain_id);
        chain.extend(head, "alice");
        chain.set_lib(lib);
        chain
    }

    /// A block extending `previous`.
    pub fn make_block(previous: BlockId, producer: &str) -> SignedBlock {
        SignedBlock {
            header: BlockHeader {
                timestamp: Timestamp::from_secs(u64::from(previous.num()) + 1),
                producer: producer.to_string(),
                previous,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A block extending our head that includes `txns`.
    pub fn next_block(&self, producer: &str, txns: &[PackedTransaction]) -> SignedBlock {
        let mut block = Self::make_block(self.head_block_id(), producer);
        block.transactions = txns
            .iter()
            .map(|t| TransactionReceipt {
                status: TransactionStatus::Executed,
                cpu_usage_us: 0,
                net_usage_words: 0,
                trx: ReceiptTrx::Packed(t.clone()),
            })
            .collect();
        block
    }

    /// Append `count` blocks from `producer`.
    pub fn extend(&mut self, count: BlockNum, producer: &str) {
        for _ in 0..count {
            let block = Self::make_block(self.head_block_id(), producer);
            self.blocks.push(block);
        }
    }

    pub fn set_lib(&mut self, lib: BlockNum) {
        self.lib = lib.min(self.head_block_num());
    }

    pub fn add_producer_key(&mut self, key: PublicKey) {
        self.producer_keys.insert(key);
    }

    pub fn reject_transaction(&mut self, id: TxId) {
        self.rejected_txns.insert(id);
    }

    /// The next `push_block` fails with `err`.
    pub fn fail_next_push(&mut self, err: ChainError) {
        self.fail_next_push = Some(err);
    }

    pub fn accepted_transactions(&self) -> &[TxId] {
        &self.accepted_txns
    }

    pub fn blocks(&self) -> &[SignedBlock] {
        &self.blocks
    }
}

impl Chain for NullChain {
    fn chain_id(&self) -> Digest {
        self.chain_id
    }

    fn head_block_num(&self) -> BlockNum {
        self.blocks.len() as BlockNum
    }

    fn head_block_id(&self) -> BlockId {
        self.blocks.last().map(SignedBlock::id).unwrap_or(BlockId::ZERO)
    }

    fn head_block_time(&self) -> Timestamp {
        self.blocks
            .last()
            .map(|b| b.header.timestamp)
            .unwrap_or(Timestamp::EPOCH)
    }

    fn last_irreversible_block_num(&self) -> BlockNum {
        self.lib
    }

    fn last_irreversible_block_id(&self) -> BlockId {
        self.get_block_id_for_num(self.lib).unwrap_or(BlockId::ZERO)
    }

    fn get_block_id_for_num(&self, num: BlockNum) -> Result<BlockId, ChainError> {
        self.fetch_block_by_number(num)
            .map(|b| b.id())
            .ok_or(ChainError::UnknownBlock(num))
    }

    fn fetch_block_by_id(&self, id: &BlockId) -> Option<SignedBlock> {
        self.fetch_block_by_number(id.num()).filter(|b| b.id() == *id)
    }

    fn fetch_block_by_number(&self, num: BlockNum) -> Option<SignedBlock> {
        let index = usize::try_from(num).ok()?.checked_sub(1)?;
        self.blocks.get(index).cloned()
    }

    fn push_block(&mut self, block: SignedBlock) -> Result<(), ChainError> {
        if let Some(err) = self.fail_next_push.take() {
            return Err(err);
        }
        if block.previous() != self.head_block_id() {
            return Err(ChainError::Unlinkable(format!(
                "block {} does not extend head {}",
                block.block_num(),
                self.head_block_num()
            )));
        }
        self.blocks.push(block);
        Ok(())
    }

    fn accept_transaction(&mut self, trx: &PackedTransaction) -> Result<(), ChainError> {
        let id = trx.id();
        if self.rejected_txns.contains(&id) {
            return Err(ChainError::Transaction(format!("{id} rejected")));
        }
        self.accepted_txns.push(id);
        Ok(())
    }

    fn is_producer_key(&self, key: &PublicKey) -> bool {
        self.producer_keys.contains(key)
    }
}
