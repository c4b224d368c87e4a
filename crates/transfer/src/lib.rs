//! Chunking, chunk lifecycle and file hashing for resumable uploads.
//!
//! A file is cut into fixed-size [`ChunkSlice`]s by [`create_chunks`], each
//! slice is tracked by a [`Chunk`] state machine, and the whole file is
//! folded into one content identifier by the [`FileHasher`] actor.

mod chunk;
mod chunker;
mod hasher;
mod progress;
mod source;

pub use chunk::{Chunk, ChunkStatus, FailureKind};
pub use chunker::{ChunkSlice, create_chunks};
pub use hasher::{FileHasher, HASH_CHANNEL_CAPACITY, HashAlgorithm, HashHandle, HashMessage};
pub use progress::{SpeedCalculator, overall_progress};
pub use source::{ChunkSource, FileSource, MemorySource, UploadFile};

/// Default chunk size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("range {offset}+{len} is outside a source of {source_len} bytes")]
    OutOfRange {
        offset: u64,
        len: usize,
        source_len: u64,
    },

    #[error("invalid chunk transition: {from} -> {to}")]
    InvalidTransition {
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("worker stopped: {0}")]
    WorkerStopped(String),
}
