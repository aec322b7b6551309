//! Fundamental types for the ledgernet peer protocol.
//!
//! This crate defines the values shared by every other crate in the workspace:
//! block and transaction identifiers, digests, keys, signatures and timestamps.

pub mod block;
pub mod error;
pub mod hash;
pub mod keys;
pub mod time;

pub use block::{BlockId, BlockNum};
pub use error::{parse_hex_array, TypesError};
pub use hash::{Digest, TxId};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use time::Timestamp;
