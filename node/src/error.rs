use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Network(#[from] ledgernet_network::NetworkError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ledgernet_protocol::ProtocolError),

    #[error("config error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("net core is not running")]
    NotRunning,

    #[error("{0}")]
    Other(String),
}
