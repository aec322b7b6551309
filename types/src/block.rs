//! Block identifier type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Height of a block in the chain. Block 1 is the first block after genesis
/// state; 0 means "no block".
pub type BlockNum = u32;

/// A 32-byte block id.
///
/// The first four bytes hold the block number (big-endian), the rest is the
/// tail of the block header digest. A peer can therefore learn the height of
/// any block it has only seen by id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl Default for BlockId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl BlockId {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build an id from a header digest, stamping `num` into the first four bytes.
    pub fn from_digest(num: BlockNum, digest: [u8; 32]) -> Self {
        let mut bytes = digest;
        bytes[..4].copy_from_slice(&num.to_be_bytes());
        Self(bytes)
    }

    /// The block number encoded in this id.
    pub fn num(&self) -> BlockNum {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId(#{} ", self.num())?;
        for b in &self.0[4..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "\u{2026})")
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_is_stamped_big_endian() {
        let id = BlockId::from_digest(0x0102_0304, [0xAB; 32]);
        assert_eq!(&id.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(id.num(), 0x0102_0304);
        assert_eq!(id.as_bytes()[4], 0xAB);
    }

    #[test]
    fn zero_id_has_num_zero() {
        assert_eq!(BlockId::ZERO.num(), 0);
        assert!(BlockId::default().is_zero());
    }

    #[test]
    fn ids_order_by_number_first() {
        let low = BlockId::from_digest(5, [0xFF; 32]);
        let high = BlockId::from_digest(6, [0x00; 32]);
        assert!(low < high);
    }
}
