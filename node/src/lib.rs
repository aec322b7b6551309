//! ledgernet node: runs the peer session layer on a tokio reactor.
//!
//! [`start`] binds the listener and spawns the reactor task that owns the
//! network state; [`NetHandle`] is the operator's way in. Configuration,
//! logging, metrics and shutdown plumbing live alongside.

pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod metrics;
pub mod net_core;
pub mod shutdown;
pub mod tracing_spans;

pub use config::NodeConfig;
pub use error::NodeError;
pub use handle::NetHandle;
pub use logging::{init_logging, LogFormat};
pub use metrics::NetMetrics;
pub use net_core::{start, start_with_clock, NetEvent};
pub use shutdown::ShutdownController;
