//! Upload error types.

use sliceup_transfer::TransferError;
use sliceup_transport::TransportError;

use crate::hooks::{BoxError, ValueHook};

/// Errors produced by an upload run.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("an upload is already running")]
    Busy,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{hook} hook failed: {source}")]
    Resolution { hook: ValueHook, source: BoxError },

    #[error("hashing chunk {index} failed: {source}")]
    Hash { index: usize, source: TransferError },

    #[error("chunk {index} upload failed: {source}")]
    Transport { index: usize, source: TransportError },

    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        index: usize,
        attempts: usize,
        source: TransportError,
    },

    #[error("merge failed: {0}")]
    Merge(TransportError),

    #[error("upload cancelled")]
    Cancelled,

    #[error("session {0} was cancelled before its file hash was computed, start it again")]
    NotHashed(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
