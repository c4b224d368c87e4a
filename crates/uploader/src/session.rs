//! Per-file upload state shared between the orchestrator and its tasks.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sliceup_transfer::{ChunkSlice, FailureKind, TransferError, UploadFile, overall_progress};
use sliceup_transport::{TransportError, TransportResponse};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{FileInfo, MergeContext, UploadChunk};

/// State of one file across `start` and any number of `resume`s.
///
/// Locks are held only for the duration of a single read or write, never
/// across an `.await` or while a hook runs.
pub struct UploadSession {
    id: String,
    file: UploadFile,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    chunks: Vec<UploadChunk>,
    file_hash: Option<String>,
    cancel: CancellationToken,
    aborts: HashMap<usize, CancellationToken>,
    hash_progress: f64,
    hash_error: Option<String>,
    merge_response: Option<TransportResponse>,
    merge_error: Option<TransportError>,
    last_error: Option<String>,
    uploading: bool,
    merging: bool,
}

impl UploadSession {
    pub fn new(file: UploadFile, slices: Vec<ChunkSlice>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file,
            inner: RwLock::new(SessionInner {
                chunks: slices.into_iter().map(UploadChunk::new).collect(),
                file_hash: None,
                cancel: CancellationToken::new(),
                aborts: HashMap::new(),
                hash_progress: 0.0,
                hash_error: None,
                merge_response: None,
                merge_error: None,
                last_error: None,
                uploading: false,
                merging: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file(&self) -> &UploadFile {
        &self.file
    }

    pub fn file_info(&self) -> FileInfo {
        FileInfo::from(&self.file)
    }

    pub fn file_hash(&self) -> Option<String> {
        self.read().file_hash.clone()
    }

    /// Records the file hash. The first value wins.
    pub fn set_file_hash(&self, file_hash: String) {
        let mut inner = self.write();
        if inner.file_hash.is_none() {
            inner.file_hash = Some(file_hash);
            inner.hash_progress = 100.0;
        }
    }

    /// Context for file-level hooks, once the hash is known.
    pub fn merge_context(&self) -> Option<MergeContext> {
        Some(MergeContext {
            file: self.file_info(),
            file_hash: self.file_hash()?,
        })
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    pub fn chunks(&self) -> Vec<UploadChunk> {
        self.read().chunks.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    pub fn slice(&self, index: usize) -> Option<ChunkSlice> {
        self.read().chunks.get(index).map(|c| c.slice())
    }

    /// Indices of chunks that still need uploading, in order.
    pub fn resumable_indices(&self) -> Vec<usize> {
        self.read()
            .chunks
            .iter()
            .filter(|c| c.is_resumable())
            .map(|c| c.index())
            .collect()
    }

    pub fn has_resumable(&self) -> bool {
        self.read().chunks.iter().any(|c| c.is_resumable())
    }

    /// Size-weighted progress over all chunks.
    pub fn upload_progress(&self) -> f64 {
        overall_progress(&self.read().chunks)
    }

    /// Marks a chunk the server already holds as uploaded. Returns `false`
    /// if the index is unknown or the chunk cannot be skipped.
    pub fn skip_chunk(&self, index: usize) -> bool {
        let mut inner = self.write();
        match inner.chunks.get_mut(index) {
            Some(chunk) => chunk.skip().is_ok(),
            None => false,
        }
    }

    /// Moves a chunk into `Uploading` and returns the abort token for this
    /// attempt, a child of the session token.
    ///
    /// Returns `None` without touching the chunk if the session was
    /// cancelled in the meantime (or the index is unknown), so no attempt
    /// starts after `cancel()`.
    pub fn begin_attempt(&self, index: usize) -> Result<Option<CancellationToken>, TransferError> {
        let mut inner = self.write();
        if inner.cancel.is_cancelled() {
            return Ok(None);
        }
        let Some(chunk) = inner.chunks.get_mut(index) else {
            return Ok(None);
        };
        chunk.begin_upload()?;
        let abort = inner.cancel.child_token();
        inner.aborts.insert(index, abort.clone());
        Ok(Some(abort))
    }

    /// Records a successful attempt. Returns `(uploaded, total)` chunk counts.
    pub fn finish_success(
        &self,
        index: usize,
        response: TransportResponse,
    ) -> Result<(usize, usize), TransferError> {
        let mut inner = self.write();
        inner.aborts.remove(&index);
        if let Some(chunk) = inner.chunks.get_mut(index) {
            chunk.succeed(response)?;
        }
        let uploaded = inner
            .chunks
            .iter()
            .filter(|c| c.status() == sliceup_transfer::ChunkStatus::Success)
            .count();
        Ok((uploaded, inner.chunks.len()))
    }

    pub fn finish_failure(
        &self,
        index: usize,
        kind: FailureKind,
        error: TransportError,
    ) -> Result<(), TransferError> {
        let mut inner = self.write();
        inner.aborts.remove(&index);
        match inner.chunks.get_mut(index) {
            Some(chunk) => chunk.fail(kind, error),
            None => Ok(()),
        }
    }

    /// Updates a chunk's progress. Returns `true` if it moved forward.
    pub fn set_progress(&self, index: usize, percent: f64) -> bool {
        let mut inner = self.write();
        inner
            .chunks
            .get_mut(index)
            .is_some_and(|c| c.set_progress(percent))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    pub fn cancel_token(&self) -> CancellationToken {
        self.read().cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.read().cancel.is_cancelled()
    }

    /// Installs a fresh token for the next phase and forgets old aborts.
    pub fn renew_cancel(&self) -> CancellationToken {
        let mut inner = self.write();
        inner.cancel = CancellationToken::new();
        inner.aborts.clear();
        inner.cancel.clone()
    }

    /// Closes the gate and aborts every attempt in flight.
    pub fn cancel(&self) {
        let inner = self.read();
        debug!(session = %self.id, in_flight = inner.aborts.len(), "cancelling session");
        inner.cancel.cancel();
        for abort in inner.aborts.values() {
            abort.cancel();
        }
    }

    /// Aborts attempts still running without closing the gate. Used when a
    /// batch rejects while other attempts are in flight.
    pub fn abort_in_flight(&self) {
        let inner = self.read();
        for abort in inner.aborts.values() {
            abort.cancel();
        }
    }

    pub fn clear_aborts(&self) {
        self.write().aborts.clear();
    }

    // -----------------------------------------------------------------------
    // Observable fields
    // -----------------------------------------------------------------------

    pub fn set_hash_progress(&self, percent: f64) {
        self.write().hash_progress = percent;
    }

    pub fn hash_progress(&self) -> f64 {
        self.read().hash_progress
    }

    pub fn set_hash_error(&self, error: String) {
        self.write().hash_error = Some(error);
    }

    pub fn set_uploading(&self, uploading: bool) {
        self.write().uploading = uploading;
    }

    pub fn set_merging(&self, merging: bool) {
        self.write().merging = merging;
    }

    pub fn set_merge_outcome(&self, outcome: Result<TransportResponse, TransportError>) {
        let mut inner = self.write();
        match outcome {
            Ok(response) => {
                inner.merge_response = Some(response);
                inner.merge_error = None;
            }
            Err(error) => {
                inner.merge_response = None;
                inner.merge_error = Some(error);
            }
        }
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.write().last_error = error;
    }

    /// Copies the observable fields into `state`.
    pub(crate) fn fill_state(&self, state: &mut crate::types::UploaderState) {
        let inner = self.read();
        state.session_id = Some(self.id.clone());
        state.file = Some(self.file_info());
        state.file_hash = inner.file_hash.clone();
        state.hash_progress = inner.hash_progress;
        state.hash_error = inner.hash_error.clone();
        state.upload_progress = overall_progress(&inner.chunks);
        state.chunks = inner.chunks.clone();
        state.uploading = inner.uploading;
        state.merging = inner.merging;
        state.merge_response = inner.merge_response.clone();
        state.merge_error = inner.merge_error.clone();
        state.last_error = inner.last_error.clone();
    }
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("chunks", &self.chunk_count())
            .finish_non_exhaustive()
    }
}
