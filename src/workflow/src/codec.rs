//! Batch wire codec
//!
//! File and pub/sub transports carry actions as a YAML list of action records.

use crate::action::Action;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode action batch: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("Failed to encode action batch: {0}")]
    Encode(String),

    #[error("Failed to read action batch from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Decode a YAML batch of actions, preserving order.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Action>, CodecError> {
    let actions: Option<Vec<Action>> = serde_yaml::from_slice(data)?;
    Ok(actions.unwrap_or_default())
}

/// Encode a batch of actions as YAML.
pub fn encode_batch(actions: &[Action]) -> Result<Vec<u8>, CodecError> {
    serde_yaml::to_string(actions)
        .map(String::into_bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Read and decode a batch file.
pub fn read_batch_file(path: &Path) -> Result<Vec<Action>, CodecError> {
    let contents = std::fs::read(path).map_err(|source| CodecError::Read {
        path: path.display().to_string(),
        source,
    })?;
    decode_batch(&contents)
}
