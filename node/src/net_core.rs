//! The net reactor.
//!
//! One task owns the [`NetState`]. Listener, dialer, per-connection reader
//! and writer tasks and response timers only report back through the
//! [`NetEvent`] channel; the operator reaches the core through
//! [`NetHandle`](crate::NetHandle) commands.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use ledgernet_messages::{NetMessage, PackedTransaction, SignedBlock};
use ledgernet_network::{
    Chain, Clock, ConnectionId, NetState, PeerStatus, SystemClock, ADDED_CONNECTION,
    ALREADY_CONNECTED,
};
use ledgernet_protocol::FrameDecoder;
use ledgernet_types::{BlockNum, Digest};

use crate::config::NodeConfig;
use crate::handle::NetHandle;
use crate::metrics::NetMetrics;
use crate::tracing_spans::{command_span, io_span, message_span};
use crate::NodeError;

/// Timeout for an outbound TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What the auxiliary tasks report to the reactor.
#[derive(Debug)]
pub enum NetEvent {
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
    },
    Dialed {
        id: ConnectionId,
        result: io::Result<TcpStream>,
    },
    Message {
        id: ConnectionId,
        msg: NetMessage,
    },
    ReadFailed {
        id: ConnectionId,
        error: String,
    },
    WriteDone {
        id: ConnectionId,
    },
    WriteFailed {
        id: ConnectionId,
        error: String,
    },
    ResponseTimeout {
        id: ConnectionId,
        token: u64,
    },
}

/// Operator requests, answered over `oneshot` channels.
pub(crate) enum Command {
    Connect {
        addr: String,
        reply: oneshot::Sender<String>,
    },
    Disconnect {
        addr: String,
        reply: oneshot::Sender<String>,
    },
    Status {
        addr: String,
        reply: oneshot::Sender<Option<PeerStatus>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    ChainHead {
        reply: oneshot::Sender<(BlockNum, BlockNum)>,
    },
    Metrics {
        reply: oneshot::Sender<Option<String>>,
    },
    BroadcastBlock(SignedBlock),
    BroadcastTransaction(PackedTransaction),
    Shutdown,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Status { .. } => "status",
            Command::Connections { .. } => "connections",
            Command::ChainHead { .. } => "chain_head",
            Command::Metrics { .. } => "metrics",
            Command::BroadcastBlock(_) => "broadcast_block",
            Command::BroadcastTransaction(_) => "broadcast_transaction",
            Command::Shutdown => "shutdown",
        }
    }
}

struct Timings {
    resp_expected: Duration,
    connection_cleanup: Duration,
    txn_expiry: Duration,
    keepalive: Duration,
    max_message_size: usize,
}

impl Timings {
    fn from_config(config: &NodeConfig) -> Self {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        Self {
            resp_expected: secs(config.resp_expected_period_secs),
            connection_cleanup: secs(config.connection_cleanup_period_secs),
            txn_expiry: secs(config.txn_expiry_period_secs),
            keepalive: secs(config.keepalive_interval_secs),
            max_message_size: config.max_message_size,
        }
    }
}

/// Socket tasks of one live session.
struct SessionIo {
    writer: mpsc::UnboundedSender<Vec<Arc<[u8]>>>,
    read_task: AbortHandle,
    write_task: AbortHandle,
}

impl SessionIo {
    fn abort(self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

pub struct NetCore<C: Chain> {
    state: NetState<C>,
    timings: Timings,
    events: mpsc::UnboundedSender<NetEvent>,
    sessions: HashMap<ConnectionId, SessionIo>,
    dials: HashMap<ConnectionId, AbortHandle>,
    timers: HashMap<ConnectionId, (u64, AbortHandle)>,
    listener: AbortHandle,
    metrics: Option<NetMetrics>,
}

/// Bind the listener and spawn the reactor on the system clock.
///
/// The core stops on [`NetHandle::shutdown`] or when `shutdown` fires.
pub async fn start<C: Chain + 'static>(
    config: &NodeConfig,
    chain: C,
    shutdown: broadcast::Receiver<()>,
) -> Result<(NetHandle, JoinHandle<()>), NodeError> {
    start_with_clock(config, chain, Arc::new(SystemClock), shutdown).await
}

pub async fn start_with_clock<C: Chain + 'static>(
    config: &NodeConfig,
    chain: C,
    clock: Arc<dyn Clock>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(NetHandle, JoinHandle<()>), NodeError> {
    let listener = TcpListener::bind(&config.listen_endpoint).await?;
    let local_addr = listener.local_addr()?;

    let node_id = Digest::new(rand::random::<[u8; 32]>());
    let handshaker = config.handshaker(node_id, &local_addr.to_string())?;
    let mut state = NetState::new(chain, handshaker, config.net_settings(), clock);
    for peer in &config.peers {
        state.add_configured_peer(peer.clone());
    }
    let metrics = if config.enable_metrics {
        Some(NetMetrics::new()?)
    } else {
        None
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let listener = tokio::spawn(accept_loop(listener, events_tx.clone())).abort_handle();

    tracing::info!(
        listen = %local_addr,
        node_id = %node_id.short_hex(7),
        peers = config.peers.len(),
        "net core starting"
    );

    let core = NetCore {
        state,
        timings: Timings::from_config(config),
        events: events_tx,
        sessions: HashMap::new(),
        dials: HashMap::new(),
        timers: HashMap::new(),
        listener,
        metrics,
    };
    let task = tokio::spawn(core.run(events_rx, commands_rx, shutdown));
    Ok((NetHandle::new(commands_tx, local_addr), task))
}

impl<C: Chain + 'static> NetCore<C> {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<NetEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut monitor = interval(self.timings.connection_cleanup);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(self.timings.txn_expiry);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = interval_at(
            Instant::now() + self.timings.keepalive,
            self.timings.keepalive,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signal_live = true;

        loop {
            tokio::select! {
                biased;
                res = shutdown.recv(), if signal_live => {
                    if let Err(broadcast::error::RecvError::Closed) = res {
                        signal_live = false;
                        continue;
                    }
                    tracing::info!("net core shutting down");
                    break;
                }
                Some(cmd) = commands.recv() => {
                    if !self.handle_command(cmd) {
                        tracing::info!("net core shutdown requested");
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = monitor.tick() => self.dial_configured(),
                _ = expiry.tick() => self.state.expire_txns(),
                _ = keepalive.tick() => self.state.keepalive(),
            }
            self.after_step();
        }
        self.stop();
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        let _span = command_span(cmd.name()).entered();
        match cmd {
            Command::Connect { addr, reply } => {
                let result = match self.state.connect(&addr) {
                    Some(id) => {
                        self.dial(id, addr);
                        ADDED_CONNECTION
                    }
                    None => ALREADY_CONNECTED,
                };
                let _ = reply.send(result.to_string());
            }
            Command::Disconnect { addr, reply } => {
                let _ = reply.send(self.state.disconnect(&addr).to_string());
            }
            Command::Status { addr, reply } => {
                let _ = reply.send(self.state.status(&addr));
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.state.statuses());
            }
            Command::ChainHead { reply } => {
                let chain = self.state.chain();
                let _ = reply.send((
                    chain.head_block_num(),
                    chain.last_irreversible_block_num(),
                ));
            }
            Command::Metrics { reply } => {
                self.update_metrics();
                let text = self.metrics.as_ref().and_then(|m| match m.encode() {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(error = %e, "metrics encoding failed");
                        None
                    }
                });
                let _ = reply.send(text);
            }
            Command::BroadcastBlock(block) => self.state.broadcast_block(&block),
            Command::BroadcastTransaction(trx) => self.state.broadcast_transaction(&trx),
            Command::Shutdown => return false,
        }
        true
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted { stream, remote } => {
                let _span = io_span(None, "accepted").entered();
                if let Some(id) = self.state.accept_inbound(remote) {
                    self.attach(id, stream);
                }
            }
            NetEvent::Dialed { id, result } => {
                let _span = io_span(Some(id), "dialed").entered();
                self.dials.remove(&id);
                if self.state.connection(id).is_none() {
                    // Session was dropped while the connect was in flight.
                    return;
                }
                match result.and_then(|stream| stream.peer_addr().map(|remote| (stream, remote))) {
                    Ok((stream, remote)) => {
                        self.attach(id, stream);
                        self.state.dial_succeeded(id, remote);
                    }
                    Err(e) => self.state.dial_failed(id, &e.to_string()),
                }
            }
            NetEvent::Message { id, msg } => {
                let _span = message_span(id, msg.type_name()).entered();
                self.state.handle_message(id, msg);
            }
            NetEvent::ReadFailed { id, error } | NetEvent::WriteFailed { id, error } => {
                let _span = io_span(Some(id), "failed").entered();
                self.state.on_io_error(id, &error);
            }
            NetEvent::WriteDone { id } => self.state.on_write_complete(id),
            NetEvent::ResponseTimeout { id, token } => {
                if self.timers.get(&id).map(|(t, _)| *t) == Some(token) {
                    self.timers.remove(&id);
                }
                self.state.on_response_timeout(id, token);
            }
        }
    }

    /// Dial every configured peer without a live session.
    fn dial_configured(&mut self) {
        for addr in self.state.peers_to_dial() {
            let id = self.state.start_dial(&addr);
            self.dial(id, addr);
        }
    }

    fn dial(&mut self, id: ConnectionId, addr: String) {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            let _ = events.send(NetEvent::Dialed { id, result });
        });
        self.dials.insert(id, task.abort_handle());
    }

    fn attach(&mut self, id: ConnectionId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = %id, error = %e, "cannot set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(read_loop(
            id,
            reader,
            self.timings.max_message_size,
            self.events.clone(),
        ))
        .abort_handle();
        let write_task =
            tokio::spawn(write_loop(id, writer, batches_rx, self.events.clone())).abort_handle();
        self.sessions.insert(
            id,
            SessionIo {
                writer: batches_tx,
                read_task,
                write_task,
            },
        );
    }

    /// Bring sockets and timers in line with the session state after any
    /// event: drop closed sessions, flush queued writes, arm or cancel
    /// response timers.
    fn after_step(&mut self) {
        for id in self.state.take_closed() {
            if let Some(io) = self.sessions.remove(&id) {
                io.abort();
            }
            if let Some(dial) = self.dials.remove(&id) {
                dial.abort();
            }
        }

        for (id, io) in &self.sessions {
            if let Some(batch) = self.state.take_write_batch(*id) {
                // A closed channel means the writer already reported its
                // failure; the event will close the session.
                let _ = io.writer.send(batch);
            }
        }

        self.reconcile_timers();
        self.update_metrics();
    }

    fn reconcile_timers(&mut self) {
        let mut wanted = HashMap::new();
        for c in self.state.connections().iter() {
            if let Some(wait) = c.response_wait() {
                wanted.insert(c.id(), wait.token);
            }
        }

        self.timers.retain(|id, (token, handle)| {
            let keep = wanted.get(id) == Some(&*token);
            if !keep {
                handle.abort();
            }
            keep
        });

        for (id, token) in wanted {
            if self.timers.contains_key(&id) {
                continue;
            }
            let events = self.events.clone();
            let period = self.timings.resp_expected;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(period).await;
                let _ = events.send(NetEvent::ResponseTimeout { id, token });
            })
            .abort_handle();
            self.timers.insert(id, (token, handle));
        }
    }

    fn update_metrics(&mut self) {
        let Some(metrics) = self.metrics.as_mut() else {
            return;
        };
        metrics.peers.set(self.state.current_peers() as i64);
        metrics.connections.set(self.state.connections().len() as i64);
        metrics.sync_state.set(self.state.sync().state().as_i64());
        metrics.observe(self.state.stats());
    }

    fn stop(mut self) {
        self.state.close_all();
        self.state.take_closed();
        self.listener.abort();
        for (_, io) in self.sessions.drain() {
            io.abort();
        }
        for (_, dial) in self.dials.drain() {
            dial.abort();
        }
        for (_, (_, timer)) in self.timers.drain() {
            timer.abort();
        }
        tracing::info!("net core stopped");
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if events.send(NetEvent::Accepted { stream, remote }).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    max_message_size: usize,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let mut decoder = FrameDecoder::new(max_message_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break e.to_string(),
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_message() {
                Ok(Some(msg)) => {
                    if events.send(NetEvent::Message { id, msg }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(NetEvent::ReadFailed {
                        id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
    };
    let _ = events.send(NetEvent::ReadFailed { id, error });
}

/// Writes batches strictly in submission order; one `WriteDone` per batch.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut batches: mpsc::UnboundedReceiver<Vec<Arc<[u8]>>>,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    while let Some(batch) = batches.recv().await {
        let mut result = Ok(());
        for bytes in &batch {
            result = writer.write_all(bytes).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = writer.flush().await;
        }
        let event = match result {
            Ok(()) => NetEvent::WriteDone { id },
            Err(e) => NetEvent::WriteFailed {
                id,
                error: e.to_string(),
            },
        };
        let failed = matches!(event, NetEvent::WriteFailed { .. });
        if events.send(event).is_err() || failed {
            return;
        }
    }
    let _ = writer.shutdown().await;
}
