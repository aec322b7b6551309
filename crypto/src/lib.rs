//! Cryptographic primitives for the ledgernet peer protocol.
//!
//! - **SHA-256** for handshake tokens, transaction ids and block ids
//! - **Ed25519** for signing and verifying handshake tokens

pub mod hash;
pub mod keys;
pub mod sign;

pub use hash::{hash_time, sha256, sha256_digest, sha256_multi, tx_id};
pub use keys::{generate_keypair, keypair_from_private, keypair_from_seed, public_from_private};
pub use sign::{sign_digest, verify_digest};
