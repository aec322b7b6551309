//! Errors raised when parsing textual forms of the fundamental types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Decode a fixed-size hex string (no prefix) into a byte array.
pub fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N], TypesError> {
    let s = s.trim();
    let bytes = hex::decode(s).map_err(|_| TypesError::InvalidHex(s.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| TypesError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}
