//! Peer-to-peer message types for the ledgernet net layer.
//!
//! Every frame on a peer connection carries exactly one [`NetMessage`]. The
//! variant order fixes the one-byte type tag used by the codec, so new
//! message kinds may only ever be appended.

pub mod block;
pub mod transaction;

pub use block::{BlockHeader, ReceiptTrx, SignedBlock, TransactionReceipt, TransactionStatus};
pub use transaction::{Compression, PackedTransaction};

use ledgernet_types::{BlockId, BlockNum, Digest, PublicKey, Signature, Timestamp, TxId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First message on every session, and re-sent whenever our chain view
/// changes enough that peers must re-evaluate sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub network_version: u16,
    pub chain_id: Digest,
    pub node_id: Digest,
    pub key: PublicKey,
    pub time: Timestamp,
    /// `sha256(time)`, or zero for an unsigned handshake.
    pub token: Digest,
    pub sig: Signature,
    pub p2p_address: String,
    pub last_irreversible_block_num: BlockNum,
    pub last_irreversible_block_id: BlockId,
    pub head_num: BlockNum,
    pub head_id: BlockId,
    pub os: String,
    pub agent: String,
    pub generation: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSizeMessage {
    pub last_irreversible_block_num: BlockNum,
    pub last_irreversible_block_id: BlockId,
    pub head_num: BlockNum,
    pub head_id: BlockId,
}

/// Why a session is being torn down. Encoded by variant index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoAwayReason {
    #[default]
    None,
    SelfConnect,
    Duplicate,
    WrongChain,
    WrongVersion,
    Forked,
    Unlinkable,
    BadTransaction,
    Validation,
    BenignOther,
    FatalOther,
    Authentication,
    Crazy,
}

impl GoAwayReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoAwayReason::None => "no reason",
            GoAwayReason::SelfConnect => "self connect",
            GoAwayReason::Duplicate => "duplicate",
            GoAwayReason::WrongChain => "wrong chain",
            GoAwayReason::WrongVersion => "wrong version",
            GoAwayReason::Forked => "chain is forked",
            GoAwayReason::Unlinkable => "unlinkable block received",
            GoAwayReason::BadTransaction => "bad transaction",
            GoAwayReason::Validation => "invalid block",
            GoAwayReason::BenignOther => "some other non-fatal condition",
            GoAwayReason::FatalOther => "some other failure",
            GoAwayReason::Authentication => "authentication failure",
            GoAwayReason::Crazy => "crazy",
        }
    }
}

impl fmt::Display for GoAwayReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoAwayMessage {
    pub reason: GoAwayReason,
    /// Sender's node id; lets the receiver recognise a duplicate session.
    pub node_id: Digest,
}

/// NTP-style clock probe. `dst` is filled in locally on receipt and is
/// never meaningful on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMessage {
    pub org: Timestamp,
    pub rec: Timestamp,
    pub xmt: Timestamp,
    pub dst: Timestamp,
}

/// How the receiver should read an id list in a notice or request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdListMode {
    #[default]
    None,
    CatchUp,
    LastIrrCatchUp,
    Normal,
}

impl fmt::Display for IdListMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdListMode::None => "none",
            IdListMode::CatchUp => "catch up",
            IdListMode::LastIrrCatchUp => "last irreversible",
            IdListMode::Normal => "normal",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectIds<T> {
    pub mode: IdListMode,
    pub pending: u32,
    pub ids: Vec<T>,
}

impl<T> SelectIds<T> {
    pub fn new(mode: IdListMode, pending: u32, ids: Vec<T>) -> Self {
        Self { mode, pending, ids }
    }

    pub fn empty(&self) -> bool {
        self.mode == IdListMode::None || self.ids.is_empty()
    }
}

/// Advertises transactions and blocks the sender holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeMessage {
    pub known_trx: SelectIds<TxId>,
    pub known_blocks: SelectIds<BlockId>,
}

/// Asks the receiver to send the listed (or all missing) items.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub req_trx: SelectIds<TxId>,
    pub req_blocks: SelectIds<BlockId>,
}

/// Pull request for an inclusive block range. `end_block == 0` cancels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestMessage {
    pub start_block: BlockNum,
    pub end_block: BlockNum,
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    Handshake(HandshakeMessage),
    ChainSize(ChainSizeMessage),
    GoAway(GoAwayMessage),
    Time(TimeMessage),
    Notice(NoticeMessage),
    Request(RequestMessage),
    SyncRequest(SyncRequestMessage),
    SignedBlock(SignedBlock),
    PackedTransaction(PackedTransaction),
}

impl NetMessage {
    /// Number of distinct message kinds; tags are `0..COUNT`.
    pub const COUNT: u8 = 9;

    /// One-byte type tag written in front of the payload.
    pub fn tag(&self) -> u8 {
        match self {
            NetMessage::Handshake(_) => 0,
            NetMessage::ChainSize(_) => 1,
            NetMessage::GoAway(_) => 2,
            NetMessage::Time(_) => 3,
            NetMessage::Notice(_) => 4,
            NetMessage::Request(_) => 5,
            NetMessage::SyncRequest(_) => 6,
            NetMessage::SignedBlock(_) => 7,
            NetMessage::PackedTransaction(_) => 8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NetMessage::Handshake(_) => "handshake",
            NetMessage::ChainSize(_) => "chain_size",
            NetMessage::GoAway(_) => "go_away",
            NetMessage::Time(_) => "time",
            NetMessage::Notice(_) => "notice",
            NetMessage::Request(_) => "request",
            NetMessage::SyncRequest(_) => "sync_request",
            NetMessage::SignedBlock(_) => "signed_block",
            NetMessage::PackedTransaction(_) => "packed_transaction",
        }
    }
}

macro_rules! impl_from_message {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for NetMessage {
                fn from(msg: $ty) -> Self {
                    NetMessage::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message! {
    HandshakeMessage => Handshake,
    ChainSizeMessage => ChainSize,
    GoAwayMessage => GoAway,
    TimeMessage => Time,
    NoticeMessage => Notice,
    RequestMessage => Request,
    SyncRequestMessage => SyncRequest,
    SignedBlock => SignedBlock,
    PackedTransaction => PackedTransaction,
}
