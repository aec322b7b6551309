//! Peer-to-peer net layer for the ledgernet chain.
//!
//! Session state, handshake admission, catch-up synchronization and relay of
//! blocks and transactions. Everything here is synchronous; the node crate
//! runs it on a tokio reactor and moves the bytes.

pub mod chain;
pub mod clock;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
mod handlers;
pub mod handshake;
pub mod index;
pub mod state;
pub mod sync;

pub use chain::{Chain, ChainError};
pub use clock::{Clock, SystemClock};
pub use connection::{
    Connection, ConnectionId, ConnectionSet, ConnectionState, PeerStatus, ResponseWait,
    SessionMode, SyncState, WaitKind, WriteCompletion,
};
pub use context::NetContext;
pub use dispatch::DispatchManager;
pub use error::NetworkError;
pub use handshake::{AllowedConnections, Handshaker};
pub use index::{
    IndexRecord, KnowledgeIndex, NodeTransactionIndex, NodeTransactionState, PeerBlockIndex,
    PeerBlockState, TransactionIndex, TransactionState,
};
pub use state::{
    NetSettings, NetState, NetStats, ADDED_CONNECTION, ALREADY_CONNECTED, CONNECTION_REMOVED,
    NO_KNOWN_CONNECTION,
};
pub use sync::{SyncManager, SyncStage};
