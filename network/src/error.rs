use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
