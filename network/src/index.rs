//! Ordered knowledge indices over blocks and transactions.
//!
//! A [`KnowledgeIndex`] keeps records unique by id and maintains two
//! secondary orderings over the same records: by expiry time and by the
//! number of the block that contains the item. Both orderings support
//! range erase in `O(log n + k)`, which is how stale knowledge is purged
//! once it expires or once its block becomes irreversible.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use ledgernet_types::{BlockId, BlockNum, Timestamp, TxId};

/// Secondary keys a record exposes to its index.
pub trait IndexRecord {
    /// Expiry used by [`KnowledgeIndex::erase_expired_through`]. Records
    /// returning `None` are never expired by time.
    fn expires(&self) -> Option<Timestamp>;

    /// Containing block number; 0 means "not in a block yet".
    fn block_num(&self) -> BlockNum;

    /// A pinned record survives expiry sweeps.
    fn pinned(&self) -> bool {
        false
    }
}

/// Records unique by `K`, with by-expiry and by-block-number views.
#[derive(Debug, Clone)]
pub struct KnowledgeIndex<K, R> {
    records: BTreeMap<K, R>,
    by_expiry: BTreeMap<Timestamp, BTreeSet<K>>,
    by_block_num: BTreeMap<BlockNum, BTreeSet<K>>,
}

impl<K, R> Default for KnowledgeIndex<K, R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_expiry: BTreeMap::new(),
            by_block_num: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Copy, R: IndexRecord> KnowledgeIndex<K, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&R> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &R)> {
        self.records.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.records.keys()
    }

    /// Iterate records in expiry order (ties broken by id). Records without
    /// an expiry are not visited.
    pub fn iter_by_expiry(&self) -> impl Iterator<Item = &R> {
        self.by_expiry
            .values()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.records.get(k))
    }

    /// Insert `record` under `key`, replacing (and returning) any previous one.
    pub fn insert(&mut self, key: K, record: R) -> Option<R> {
        let old = self.remove(&key);
        self.link(key, &record);
        self.records.insert(key, record);
        old
    }

    /// Insert only if `key` is absent. Returns whether the record was added.
    pub fn insert_new(&mut self, key: K, record: R) -> bool {
        if self.records.contains_key(&key) {
            return false;
        }
        self.link(key, &record);
        self.records.insert(key, record);
        true
    }

    /// Update a record in place, re-keying the secondary views if the
    /// expiry or block number changed. Returns `false` if `key` is absent.
    pub fn modify(&mut self, key: &K, f: impl FnOnce(&mut R)) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        let before = (record.expires(), record.block_num());
        f(record);
        let after = (record.expires(), record.block_num());
        if before != after {
            Self::unlink_keys(&mut self.by_expiry, &mut self.by_block_num, *key, before);
            Self::link_keys(&mut self.by_expiry, &mut self.by_block_num, *key, after);
        }
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<R> {
        let record = self.records.remove(key)?;
        Self::unlink_keys(
            &mut self.by_expiry,
            &mut self.by_block_num,
            *key,
            (record.expires(), record.block_num()),
        );
        Some(record)
    }

    /// Erase every unpinned record whose expiry is at or before `t`.
    /// Returns the number of records removed.
    pub fn erase_expired_through(&mut self, t: Timestamp) -> usize {
        let doomed: Vec<K> = self
            .by_expiry
            .range(..=t)
            .flat_map(|(_, keys)| keys.iter().copied())
            .filter(|k| self.records.get(k).is_some_and(|r| !r.pinned()))
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Erase every record whose block number falls in `range`.
    pub fn erase_block_num_range(&mut self, range: RangeInclusive<BlockNum>) -> usize {
        if range.is_empty() {
            return 0;
        }
        let doomed: Vec<K> = self
            .by_block_num
            .range(range)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_expiry.clear();
        self.by_block_num.clear();
    }

    fn link(&mut self, key: K, record: &R) {
        Self::link_keys(
            &mut self.by_expiry,
            &mut self.by_block_num,
            key,
            (record.expires(), record.block_num()),
        );
    }

    fn link_keys(
        by_expiry: &mut BTreeMap<Timestamp, BTreeSet<K>>,
        by_block_num: &mut BTreeMap<BlockNum, BTreeSet<K>>,
        key: K,
        (expires, block_num): (Option<Timestamp>, BlockNum),
    ) {
        if let Some(t) = expires {
            by_expiry.entry(t).or_default().insert(key);
        }
        by_block_num.entry(block_num).or_default().insert(key);
    }

    fn unlink_keys(
        by_expiry: &mut BTreeMap<Timestamp, BTreeSet<K>>,
        by_block_num: &mut BTreeMap<BlockNum, BTreeSet<K>>,
        key: K,
        (expires, block_num): (Option<Timestamp>, BlockNum),
    ) {
        if let Some(t) = expires {
            if let Some(keys) = by_expiry.get_mut(&t) {
                keys.remove(&key);
                if keys.is_empty() {
                    by_expiry.remove(&t);
                }
            }
        }
        if let Some(keys) = by_block_num.get_mut(&block_num) {
            keys.remove(&key);
            if keys.is_empty() {
                by_block_num.remove(&block_num);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// What one peer knows about one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerBlockState {
    pub id: BlockId,
    pub block_num: BlockNum,
    /// The peer holds the block (it sent it, or we sent it).
    pub is_known: bool,
    /// The block was announced to or by the peer.
    pub is_noticed: bool,
    /// When we asked the peer for it; epoch if never requested.
    pub request_time: Timestamp,
}

impl IndexRecord for PeerBlockState {
    fn expires(&self) -> Option<Timestamp> {
        None
    }

    fn block_num(&self) -> BlockNum {
        self.block_num
    }
}

/// What one peer knows about one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionState {
    pub id: TxId,
    pub is_known_by_peer: bool,
    pub is_noticed_to_peer: bool,
    pub block_num: BlockNum,
    pub expires: Timestamp,
    pub request_time: Timestamp,
}

impl IndexRecord for TransactionState {
    fn expires(&self) -> Option<Timestamp> {
        Some(self.expires)
    }

    fn block_num(&self) -> BlockNum {
        self.block_num
    }
}

/// A transaction in the node-wide pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTransactionState {
    pub id: TxId,
    pub expires: Timestamp,
    pub block_num: BlockNum,
    /// The framed `PackedTransaction`, ready to queue on any connection.
    pub serialized_txn: Arc<[u8]>,
    /// Sends of this transaction still sitting in some write queue.
    pub requests: u32,
}

impl IndexRecord for NodeTransactionState {
    fn expires(&self) -> Option<Timestamp> {
        Some(self.expires)
    }

    fn block_num(&self) -> BlockNum {
        self.block_num
    }

    fn pinned(&self) -> bool {
        self.requests > 0
    }
}

pub type PeerBlockIndex = KnowledgeIndex<BlockId, PeerBlockState>;
pub type TransactionIndex = KnowledgeIndex<TxId, TransactionState>;
pub type NodeTransactionIndex = KnowledgeIndex<TxId, NodeTransactionState>;
