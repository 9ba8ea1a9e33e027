//! This module defines the errors that can be surfaced to users of the counter core.

use std::fmt::Display;

use bytes::Bytes;
use serde::Serialize;

use crate::utils::serde_utf8_bytes;

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Serialize)]
pub enum Error {
    /// The hash ring has no nodes. Fatal at startup, non-retryable.
    NoAvailableNode,
    /// The node that owns the key is unreachable after the retry budget was spent.
    /// Recovery happens via the background health probe and the next flush cycle.
    StorageUnavailable {
        #[serde(with = "serde_utf8_bytes")]
        key: Bytes,
        node: String,
        reason: String,
    },
    /// Some keys in a flush cycle failed. Their deltas stay buffered and retry
    /// on the next cycle.
    PartialFlushFailure { failed_keys: Vec<String> },
    InvalidConfig { reason: String },
    Io { reason: String },
    Logic { reason: String },
}

impl Error {
    /// Returns true if this is an instance of a [`Error::StorageUnavailable`] variant
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Error::StorageUnavailable { .. })
    }

    /// Returns true if this is an instance of a [`Error::NoAvailableNode`] variant
    pub fn is_no_available_node(&self) -> bool {
        matches!(self, Error::NoAvailableNode)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
