//! Nullable infrastructure for deterministic testing.
//!
//! The chain, the clock and the socket side of the net layer are swapped
//! for in-memory versions that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Never touch the filesystem or network

pub mod chain;
pub mod clock;
pub mod wire;

pub use chain::NullChain;
pub use clock::NullClock;
pub use wire::{drain_writes, establish, exchange};
