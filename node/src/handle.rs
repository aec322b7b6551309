//! Operator access to a running net core.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};

use ledgernet_messages::{PackedTransaction, SignedBlock};
use ledgernet_network::PeerStatus;
use ledgernet_types::BlockNum;

use crate::net_core::Command;
use crate::NodeError;

/// Cheap to clone; every call is a request to the reactor task. Calls fail
/// with [`NodeError::NotRunning`] once the core has stopped.
#[derive(Clone)]
pub struct NetHandle {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl NetHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, local_addr: SocketAddr) -> Self {
        Self {
            commands,
            local_addr,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| NodeError::NotRunning)
    }

    async fn send(&self, cmd: Command) -> Result<(), NodeError> {
        self.commands.send(cmd).await.map_err(|_| NodeError::NotRunning)
    }

    /// Add `addr` as a dial target and dial it now.
    pub async fn connect(&self, addr: impl Into<String>) -> Result<String, NodeError> {
        let addr = addr.into();
        self.request(|reply| Command::Connect { addr, reply }).await
    }

    pub async fn disconnect(&self, addr: impl Into<String>) -> Result<String, NodeError> {
        let addr = addr.into();
        self.request(|reply| Command::Disconnect { addr, reply }).await
    }

    pub async fn status(&self, addr: impl Into<String>) -> Result<Option<PeerStatus>, NodeError> {
        let addr = addr.into();
        self.request(|reply| Command::Status { addr, reply }).await
    }

    pub async fn connections(&self) -> Result<Vec<PeerStatus>, NodeError> {
        self.request(|reply| Command::Connections { reply }).await
    }

    /// Our head and last irreversible block numbers.
    pub async fn chain_head(&self) -> Result<(BlockNum, BlockNum), NodeError> {
        self.request(|reply| Command::ChainHead { reply }).await
    }

    /// Prometheus text exposition, `None` when metrics are disabled.
    pub async fn metrics(&self) -> Result<Option<String>, NodeError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    pub async fn broadcast_block(&self, block: SignedBlock) -> Result<(), NodeError> {
        self.send(Command::BroadcastBlock(block)).await
    }

    pub async fn broadcast_transaction(&self, trx: PackedTransaction) -> Result<(), NodeError> {
        self.send(Command::BroadcastTransaction(trx)).await
    }

    /// Close every session and stop the core.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.send(Command::Shutdown).await
    }
}
