//! Prometheus metrics for the net layer.
//!
//! [`NetMetrics`] owns a dedicated [`Registry`]; [`NetMetrics::encode`]
//! renders it in the text exposition format.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Opts, Registry, TextEncoder,
};

use ledgernet_network::NetStats;

use crate::NodeError;

pub struct NetMetrics {
    pub registry: Registry,

    /// Sessions that completed a handshake.
    pub peers: IntGauge,
    /// Every open session, including ones still connecting.
    pub connections: IntGauge,
    pub blocks_received: IntCounter,
    pub transactions_received: IntCounter,
    pub go_aways_sent: IntCounter,
    /// 0 in sync, 1 lib catch-up, 2 head catch-up.
    pub sync_state: IntGauge,

    last: NetStats,
}

impl NetMetrics {
    pub fn new() -> Result<Self, NodeError> {
        let registry = Registry::new();

        let peers = register_int_gauge_with_registry!(
            Opts::new("ledgernet_peers", "Sessions past the handshake"),
            registry
        )?;
        let connections = register_int_gauge_with_registry!(
            Opts::new("ledgernet_connections", "Open peer sessions"),
            registry
        )?;
        let blocks_received = register_int_counter_with_registry!(
            Opts::new("ledgernet_blocks_received_total", "Blocks received from peers"),
            registry
        )?;
        let transactions_received = register_int_counter_with_registry!(
            Opts::new(
                "ledgernet_transactions_received_total",
                "Transactions received from peers"
            ),
            registry
        )?;
        let go_aways_sent = register_int_counter_with_registry!(
            Opts::new("ledgernet_go_aways_sent_total", "Sessions closed with a go-away"),
            registry
        )?;
        let sync_state = register_int_gauge_with_registry!(
            Opts::new("ledgernet_sync_state", "Current synchronization stage"),
            registry
        )?;

        Ok(Self {
            registry,
            peers,
            connections,
            blocks_received,
            transactions_received,
            go_aways_sent,
            sync_state,
            last: NetStats::default(),
        })
    }

    /// Advance the counters to the core's running totals.
    pub fn observe(&mut self, stats: NetStats) {
        self.blocks_received
            .inc_by(stats.blocks_received.saturating_sub(self.last.blocks_received));
        self.transactions_received.inc_by(
            stats
                .transactions_received
                .saturating_sub(self.last.transactions_received),
        );
        self.go_aways_sent
            .inc_by(stats.go_aways_sent.saturating_sub(self.last.go_aways_sent));
        self.last = stats;
    }

    pub fn encode(&self) -> Result<String, NodeError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| NodeError::Other(e.to_string()))
    }
}
