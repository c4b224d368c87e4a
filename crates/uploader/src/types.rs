use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use sliceup_transfer::{Chunk, UploadFile};
use sliceup_transport::{TransportError, TransportResponse};

/// A chunk as tracked by the uploader.
pub type UploadChunk = Chunk<TransportResponse, TransportError>;

/// Name and size of the file being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

impl From<&UploadFile> for FileInfo {
    fn from(file: &UploadFile) -> Self {
        Self {
            name: file.name().to_string(),
            size: file.len(),
        }
    }
}

/// Context handed to per-chunk value hooks and custom upload requests.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub file: FileInfo,
    pub file_hash: String,
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    /// The chunk's bytes.
    pub data: Bytes,
}

/// Context handed to file-level value hooks and custom merge requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeContext {
    pub file: FileInfo,
    pub file_hash: String,
}

/// Where the uploader is in its pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Idle,
    Chunking,
    Hashing,
    SkipCheck,
    Uploading,
    /// Cancelled; resumable chunks are kept.
    Paused,
    Merging,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Chunking => "chunking",
            Self::Hashing => "hashing",
            Self::SkipCheck => "skip_check",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` while a run is in progress.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Paused | Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an uploader and its current session.
#[derive(Debug, Clone, Default)]
pub struct UploaderState {
    pub phase: Phase,
    pub session_id: Option<String>,
    pub file: Option<FileInfo>,
    pub file_hash: Option<String>,
    /// Hash progress, 0–100.
    pub hash_progress: f64,
    pub hash_error: Option<String>,
    pub chunks: Vec<UploadChunk>,
    /// Size-weighted upload progress across all chunks, 0–100.
    pub upload_progress: f64,
    pub uploading: bool,
    pub merging: bool,
    pub merge_response: Option<TransportResponse>,
    pub merge_error: Option<TransportError>,
    pub last_error: Option<String>,
    pub bytes_per_second: f64,
    /// Estimated time left for the chunks still to upload.
    pub eta: Option<Duration>,
}

impl UploaderState {
    /// Number of chunks in `Success`.
    pub fn uploaded_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status() == sliceup_transfer::ChunkStatus::Success)
            .count()
    }
}
