//! Upload orchestrator.
//!
//! Drives one file through chunking, hashing, an optional existence check,
//! concurrent per-chunk upload with retry, and the final merge request.
//! A run can be cancelled at any point and resumed later without
//! re-chunking or re-hashing.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use sliceup_concurrent::{ConcurrentError, ConcurrentOptions, TaskFailure, run_concurrent};
use sliceup_transfer::{
    ChunkSlice, ChunkStatus, FailureKind, FileHasher, HashMessage, SpeedCalculator, UploadFile,
    create_chunks,
};
use sliceup_transport::{
    CONTENT_TYPE, FORM_URLENCODED, MultipartForm, ProgressFn, ReqwestTransport, RequestBody,
    Transport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::hooks::{HookEvent, HookKind, ValueHook, panic_message, resolve_value};
use crate::options::{Action, CustomRequest, CustomRequestParams, RequestData, UploadOptions};
use crate::session::UploadSession;
use crate::types::{ChunkContext, MergeContext, Phase, UploaderState};

/// Everything an upload attempt needs besides the session.
struct Shared {
    config: UploadConfig,
    options: UploadOptions,
    transport: Arc<dyn Transport>,
    speed: SpeedCalculator,
}

/// Resumable chunked uploader for one file at a time.
pub struct SliceUploader {
    shared: Arc<Shared>,
    session: RwLock<Option<Arc<UploadSession>>>,
    busy: AtomicBool,
    phase: watch::Sender<Phase>,
}

/// Clears the busy flag when a run ends, including when its future is dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SliceUploader {
    pub fn new(config: UploadConfig, options: UploadOptions, transport: Arc<dyn Transport>) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                options,
                transport,
                speed: SpeedCalculator::default(),
            }),
            session: RwLock::new(None),
            busy: AtomicBool::new(false),
            phase,
        }
    }

    /// Creates an uploader backed by [`ReqwestTransport`].
    pub fn with_default_transport(
        config: UploadConfig,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        let transport = ReqwestTransport::new()
            .map_err(|e| UploadError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(config, options, Arc::new(transport)))
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    /// The current (or most recent) session.
    pub fn session(&self) -> Option<Arc<UploadSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribes to phase changes.
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Snapshot of the uploader and its session.
    pub fn state(&self) -> UploaderState {
        let mut state = UploaderState {
            phase: self.phase(),
            bytes_per_second: self.shared.speed.bytes_per_second(),
            ..Default::default()
        };
        if let Some(session) = self.session() {
            session.fill_state(&mut state);
        }
        let remaining: f64 = state
            .chunks
            .iter()
            .filter(|c| c.status() != ChunkStatus::Success)
            .map(|c| c.size() as f64 * (100.0 - c.progress()) / 100.0)
            .sum();
        state.eta = self.shared.speed.eta(remaining as u64);
        state
    }

    // -----------------------------------------------------------------------
    // Engine surface
    // -----------------------------------------------------------------------

    /// Uploads `file` from scratch, replacing any previous session.
    pub async fn start(&self, file: UploadFile) -> Result<(), UploadError> {
        let _guard = self.acquire()?;
        let session = match self.prepare(file) {
            Ok(session) => session,
            Err(e) => return self.settle(None, Err(e)),
        };
        let result = self.run(&session).await;
        self.settle(Some(&session), result)
    }

    /// Continues a cancelled or failed upload with the chunks that are not
    /// yet on the server, then merges.
    ///
    /// Does nothing without a session or without resumable chunks. A session
    /// cancelled before hashing finished has no identifier to merge under and
    /// fails with [`UploadError::NotHashed`]; call [`start`](Self::start)
    /// again for it.
    pub async fn resume(&self) -> Result<(), UploadError> {
        let _guard = self.acquire()?;
        let Some(session) = self.session() else {
            debug!("resume without session, nothing to do");
            return Ok(());
        };
        if !session.has_resumable() {
            debug!(session = %session.id(), "nothing to resume");
            return Ok(());
        }
        if session.file_hash().is_none() {
            warn!(session = %session.id(), "cannot resume a session that was never hashed");
            return Err(UploadError::NotHashed(session.id().to_string()));
        }

        session.renew_cancel();
        info!(
            session = %session.id(),
            pending = session.resumable_indices().len(),
            "resuming upload"
        );
        let result = self.upload_and_merge(&session).await;
        self.settle(Some(&session), result)
    }

    /// Stops the running upload. In-flight chunk requests are aborted and
    /// no new ones start; the pending `start`/`resume` returns
    /// [`UploadError::Cancelled`] once they have settled.
    pub fn cancel(&self) {
        if let Some(session) = self.session() {
            info!(session = %session.id(), "upload cancel requested");
            session.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    fn acquire(&self) -> Result<BusyGuard<'_>, UploadError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UploadError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            trace!(from = %previous, to = %phase, "phase changed");
        }
    }

    fn prepare(&self, file: UploadFile) -> Result<Arc<UploadSession>, UploadError> {
        self.shared.config.validate()?;
        self.set_phase(Phase::Chunking);

        let slices = create_chunks(file.len(), self.shared.config.chunk_size)?;
        let session = Arc::new(UploadSession::new(file, slices));
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        self.shared.speed.reset();

        info!(
            session = %session.id(),
            file = %session.file().name(),
            size = session.file().len(),
            chunks = session.chunk_count(),
            "upload started"
        );
        Ok(session)
    }

    async fn run(&self, session: &Arc<UploadSession>) -> Result<(), UploadError> {
        self.set_phase(Phase::Hashing);
        let slices = session.chunks().iter().map(|c| c.slice()).collect();
        self.hash(session, slices).await?;

        self.set_phase(Phase::SkipCheck);
        if let Some(check) = &self.shared.options.check_upload {
            let ctx = merge_context(session)?;
            if resolve_value(ValueHook::CheckUpload, check, ctx).await? {
                info!(session = %session.id(), "file already on server, skipping upload");
                for index in session.resumable_indices() {
                    session.skip_chunk(index);
                }
                return Ok(());
            }
        }

        self.upload_and_merge(session).await
    }

    async fn hash(&self, session: &UploadSession, slices: Vec<ChunkSlice>) -> Result<(), UploadError> {
        let hooks = &self.shared.options.hooks;
        let file = session.file_info();
        hooks.dispatch(&HookEvent::BeforeFileHash {
            file: file.clone(),
            chunk_count: slices.len(),
        });

        let cancel = session.cancel_token();
        let mut handle = FileHasher::spawn(session.file(), slices, self.shared.config.hash_algorithm);
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                message = handle.recv() => message,
            };

            match message {
                Some(HashMessage::Progress { index, percent }) => {
                    session.set_hash_progress(percent);
                    hooks.dispatch(&HookEvent::FileHashProgress {
                        file: file.clone(),
                        index,
                        percent,
                    });
                }
                Some(HashMessage::Done { file_hash }) => {
                    debug!(session = %session.id(), %file_hash, "file hashed");
                    session.set_file_hash(file_hash.clone());
                    hooks.dispatch(&HookEvent::FileHashSuccess { file, file_hash });
                    return Ok(());
                }
                Some(HashMessage::Failed { index, error }) => {
                    session.set_hash_error(error.to_string());
                    hooks.dispatch(&HookEvent::FileHashError {
                        file,
                        index,
                        error: error.to_string(),
                    });
                    return Err(UploadError::Hash {
                        index,
                        source: error,
                    });
                }
                None => {
                    let error = handle.stopped().await;
                    session.set_hash_error(error.to_string());
                    return Err(error.into());
                }
            }
        }
    }

    async fn upload_and_merge(&self, session: &Arc<UploadSession>) -> Result<(), UploadError> {
        self.set_phase(Phase::Uploading);
        session.set_uploading(true);
        let uploaded = self.upload_chunks(session).await;
        session.set_uploading(false);
        session.clear_aborts();
        uploaded?;

        self.set_phase(Phase::Merging);
        self.merge(session).await
    }

    async fn upload_chunks(&self, session: &Arc<UploadSession>) -> Result<(), UploadError> {
        if let Some(skip) = &self.shared.options.skip_chunk_index {
            let ctx = merge_context(session)?;
            for index in resolve_value(ValueHook::SkipChunkIndex, skip, ctx).await? {
                if session.skip_chunk(index) {
                    debug!(session = %session.id(), index, "chunk already on server");
                }
            }
        }

        let pending = session.resumable_indices();
        if pending.is_empty() {
            debug!(session = %session.id(), "no chunks left to upload");
            return Ok(());
        }

        let cancel = session.cancel_token();
        let tracker = TaskTracker::new();
        let tasks: Vec<_> = pending
            .iter()
            .map(|&index| {
                let shared = Arc::clone(&self.shared);
                let session = Arc::clone(session);
                let tracker = tracker.clone();
                move || {
                    tracker.track_future(upload_attempt(
                        Arc::clone(&shared),
                        Arc::clone(&session),
                        index,
                    ))
                }
            })
            .collect();

        let options = ConcurrentOptions {
            max: self.shared.config.concurrent_max,
            retry_count: self.shared.config.concurrent_retry_max,
        };
        debug!(
            session = %session.id(),
            chunks = pending.len(),
            max = options.max,
            "uploading chunks"
        );
        let result = run_concurrent(&tasks, &options, || !cancel.is_cancelled()).await;

        // The scheduler detaches whatever is still running when it rejects.
        if result.is_err() {
            session.abort_in_flight();
        }
        tracker.close();
        tracker.wait().await;

        let error = match result {
            Ok(()) => return Ok(()),
            Err(_) if session.is_cancelled() => return Err(UploadError::Cancelled),
            Err(e) => e,
        };
        Err(match error {
            ConcurrentError::Halted { .. } => UploadError::Cancelled,
            ConcurrentError::RetryExhausted {
                attempts, source, ..
            } => match source {
                UploadError::Transport { index, source } => UploadError::RetryExhausted {
                    index,
                    attempts,
                    source,
                },
                other => other,
            },
            ConcurrentError::Fatal { source, .. } => source,
            ConcurrentError::Panicked { index } => {
                UploadError::Internal(format!("upload of chunk {} panicked", pending[index]))
            }
            ConcurrentError::Interrupted(message) => UploadError::Internal(message),
            ConcurrentError::InvalidLimit => {
                UploadError::Configuration("concurrent_max must be at least 1".into())
            }
        })
    }

    async fn merge(&self, session: &UploadSession) -> Result<(), UploadError> {
        let shared = &self.shared;
        let hooks = &shared.options.hooks;
        let ctx = merge_context(session)?;
        let (url, body) = shared.merge_parts(&ctx).await?;
        let custom = shared.options.custom_merge_request.clone();
        if url.is_none() && custom.is_none() {
            return Err(UploadError::Configuration("missing merge url".into()));
        }

        let mut headers = BTreeMap::new();
        if matches!(body, RequestBody::Form(_)) {
            headers.insert("Content-Type".to_string(), FORM_URLENCODED.to_string());
        }
        for (name, value) in &shared.config.merge_headers {
            if name.eq_ignore_ascii_case(CONTENT_TYPE) {
                headers.retain(|k, _| !k.eq_ignore_ascii_case(CONTENT_TYPE));
            }
            headers.insert(name.clone(), value.clone());
        }

        hooks.dispatch(&HookEvent::BeforeMergeChunk {
            file: ctx.file.clone(),
            file_hash: ctx.file_hash.clone(),
        });
        info!(session = %session.id(), file_hash = %ctx.file_hash, "merging chunks");

        session.set_merging(true);
        let abort = session.cancel_token().child_token();
        let outcome = match custom {
            Some(custom) => {
                let params = CustomRequestParams {
                    url,
                    method: shared.config.merge_method.clone(),
                    headers,
                    body,
                    context: ctx.clone(),
                    progress: Arc::new(|_: u64, _: u64| {}),
                    abort,
                };
                send_custom(custom.as_ref(), params).await
            }
            None => {
                let request = TransportRequest {
                    url: url.unwrap_or_default(),
                    method: shared.config.merge_method.clone(),
                    headers,
                    body,
                    with_credentials: shared.config.with_credentials,
                    timeout: shared.config.request_timeout(),
                };
                Ok(shared.transport.send(request, None, abort).await)
            }
        };
        session.set_merging(false);

        let MergeContext { file, file_hash } = ctx;
        match outcome {
            Ok(Ok(response)) => {
                session.set_merge_outcome(Ok(response.clone()));
                info!(session = %session.id(), %file_hash, "upload complete");
                hooks.dispatch(&HookEvent::MergeChunkSuccess {
                    file,
                    file_hash,
                    response,
                });
                Ok(())
            }
            Ok(Err(error)) => {
                session.set_merge_outcome(Err(error.clone()));
                hooks.dispatch(&HookEvent::MergeChunkError {
                    file,
                    file_hash,
                    error: error.clone(),
                });
                if error.is_aborted() && session.is_cancelled() {
                    Err(UploadError::Cancelled)
                } else {
                    Err(UploadError::Merge(error))
                }
            }
            Err(panic) => {
                let error = TransportError::network(panic.clone());
                session.set_merge_outcome(Err(error.clone()));
                hooks.dispatch(&HookEvent::MergeChunkError {
                    file,
                    file_hash,
                    error,
                });
                Err(UploadError::Resolution {
                    hook: ValueHook::CustomMergeRequest,
                    source: panic.into(),
                })
            }
        }
    }

    fn settle(
        &self,
        session: Option<&UploadSession>,
        result: Result<(), UploadError>,
    ) -> Result<(), UploadError> {
        let phase = match &result {
            Ok(()) => Phase::Done,
            Err(UploadError::Cancelled) => Phase::Paused,
            Err(_) => Phase::Failed,
        };
        let session_id = session.map(|s| s.id().to_string()).unwrap_or_default();
        match &result {
            Ok(()) => {}
            Err(UploadError::Cancelled) => info!(session = %session_id, "upload paused"),
            Err(e) => error!(session = %session_id, error = %e, "upload failed"),
        }
        if let Some(session) = session {
            session.set_last_error(result.as_ref().err().map(ToString::to_string));
        }
        self.set_phase(phase);
        result
    }
}

impl std::fmt::Debug for SliceUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceUploader")
            .field("config", &self.shared.config)
            .field("phase", &self.phase())
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

fn merge_context(session: &UploadSession) -> Result<MergeContext, UploadError> {
    session
        .merge_context()
        .ok_or_else(|| UploadError::Internal("session has no file hash".into()))
}

// ---------------------------------------------------------------------------
// Request resolution
// ---------------------------------------------------------------------------

impl Shared {
    /// URL and body for one chunk attempt. Resolved again on every attempt.
    async fn upload_parts(
        &self,
        ctx: &ChunkContext,
    ) -> Result<(Option<String>, RequestBody), UploadError> {
        let url = match &self.options.upload_action {
            Some(Action::Url(url)) => Some(url.clone()),
            Some(Action::Function(f)) => {
                Some(resolve_value(ValueHook::UploadAction, f, ctx.clone()).await?)
            }
            None => self.config.upload_url.clone(),
        };
        let url = url.filter(|u| !u.is_empty());

        let fields = match &self.options.upload_data {
            Some(RequestData::Function(f)) => {
                let body = resolve_value(ValueHook::UploadData, f, ctx.clone()).await?;
                return Ok((url, body));
            }
            Some(RequestData::Fields(fields)) => fields,
            None => &self.config.upload_fields,
        };
        let form = fields
            .iter()
            .fold(MultipartForm::new(), |form, (name, value)| form.text(name, value))
            .file(
                &self.config.name,
                format!("{}-{}", ctx.file_hash, ctx.index),
                ctx.data.clone(),
            );
        Ok((url, RequestBody::Multipart(form)))
    }

    async fn merge_parts(
        &self,
        ctx: &MergeContext,
    ) -> Result<(Option<String>, RequestBody), UploadError> {
        let url = match &self.options.merge_action {
            Some(Action::Url(url)) => Some(url.clone()),
            Some(Action::Function(f)) => {
                Some(resolve_value(ValueHook::MergeAction, f, ctx.clone()).await?)
            }
            None => self.config.merge_url.clone(),
        };
        let url = url.filter(|u| !u.is_empty());

        let fields = match &self.options.merge_data {
            Some(RequestData::Function(f)) => {
                let body = resolve_value(ValueHook::MergeData, f, ctx.clone()).await?;
                return Ok((url, body));
            }
            Some(RequestData::Fields(fields)) => fields,
            None => &self.config.merge_fields,
        };
        let mut form = BTreeMap::new();
        form.insert(self.config.merge_name.clone(), ctx.file_hash.clone());
        form.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok((url, RequestBody::Form(form)))
    }

    /// Progress callback for one attempt: updates the chunk, feeds the speed
    /// calculator and fires the progress hook.
    fn progress_fn(self: &Arc<Self>, session: &Arc<UploadSession>, file_hash: &str, index: usize) -> ProgressFn {
        let shared = Arc::clone(self);
        let session = Arc::clone(session);
        let file_hash = file_hash.to_string();
        let sent = AtomicU64::new(0);
        Arc::new(move |loaded: u64, total: u64| {
            let previous = sent.swap(loaded, Ordering::Relaxed);
            if loaded > previous {
                shared.speed.add_sample(loaded - previous);
            }
            let percent = if total == 0 {
                100.0
            } else {
                loaded as f64 / total as f64 * 100.0
            };
            let hooks = &shared.options.hooks;
            if session.set_progress(index, percent) && hooks.has(HookKind::UploadChunkProgress) {
                hooks.dispatch(&HookEvent::UploadChunkProgress {
                    file_hash: file_hash.clone(),
                    index,
                    loaded,
                    total,
                    percent,
                });
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Chunk attempt
// ---------------------------------------------------------------------------

/// One upload attempt for chunk `index`.
///
/// Transport failures are recorded on the chunk and returned as retryable.
/// Failures that retrying cannot fix (resolution, configuration, reading
/// the file) are fatal and leave the chunk untouched.
async fn upload_attempt(
    shared: Arc<Shared>,
    session: Arc<UploadSession>,
    index: usize,
) -> Result<(), TaskFailure<UploadError>> {
    if session.is_cancelled() {
        return Err(TaskFailure::Retry(UploadError::Cancelled));
    }
    let fatal = TaskFailure::Fatal;

    let (slice, file_hash) = match (session.slice(index), session.file_hash()) {
        (Some(slice), Some(file_hash)) => (slice, file_hash),
        _ => {
            return Err(fatal(UploadError::Internal(format!(
                "chunk {index} is not part of a hashed session"
            ))));
        }
    };
    let data = session
        .file()
        .read_slice_async(slice)
        .await
        .map_err(|e| fatal(e.into()))?;
    let ctx = ChunkContext {
        file: session.file_info(),
        file_hash: file_hash.clone(),
        index,
        offset: slice.offset,
        size: slice.size,
        data,
    };

    let (url, body) = shared.upload_parts(&ctx).await.map_err(fatal)?;
    let custom = shared.options.custom_upload_request.clone();
    if url.is_none() && custom.is_none() {
        return Err(fatal(UploadError::Configuration("missing upload url".into())));
    }

    shared.options.hooks.dispatch(&HookEvent::BeforeUploadChunk {
        file_hash: file_hash.clone(),
        index,
    });
    let Some(abort) = session.begin_attempt(index).map_err(|e| fatal(e.into()))? else {
        return Err(TaskFailure::Retry(UploadError::Cancelled));
    };
    trace!(session = %session.id(), index, "uploading chunk");

    let progress = shared.progress_fn(&session, &file_hash, index);
    let outcome = match custom {
        Some(custom) => {
            let params = CustomRequestParams {
                url,
                method: shared.config.upload_method.clone(),
                headers: shared.config.upload_headers.clone(),
                body,
                context: ctx,
                progress,
                abort,
            };
            send_custom(custom.as_ref(), params).await
        }
        None => {
            let request = TransportRequest {
                url: url.unwrap_or_default(),
                method: shared.config.upload_method.clone(),
                headers: shared.config.upload_headers.clone(),
                body,
                with_credentials: shared.config.with_credentials,
                timeout: shared.config.request_timeout(),
            };
            Ok(shared.transport.send(request, Some(progress), abort).await)
        }
    };

    let hooks = &shared.options.hooks;
    match outcome {
        Ok(Ok(response)) => {
            let (uploaded, total) = session
                .finish_success(index, response.clone())
                .map_err(|e| fatal(e.into()))?;
            debug!(session = %session.id(), index, uploaded, total, "chunk uploaded");
            hooks.dispatch(&HookEvent::UploadChunkSuccess {
                file_hash,
                index,
                response,
                uploaded,
                total,
            });
            Ok(())
        }
        Ok(Err(error)) => {
            let kind = match error.kind {
                TransportErrorKind::Timeout => FailureKind::TimedOut,
                TransportErrorKind::Aborted => FailureKind::Aborted,
                TransportErrorKind::Network
                | TransportErrorKind::BadResponse
                | TransportErrorKind::InvalidRequest => FailureKind::Error,
            };
            session
                .finish_failure(index, kind, error.clone())
                .map_err(|e| fatal(e.into()))?;
            if error.is_aborted() {
                debug!(session = %session.id(), index, "chunk upload aborted");
            } else {
                warn!(session = %session.id(), index, error = %error, "chunk upload failed");
            }
            hooks.dispatch(&HookEvent::UploadChunkError {
                file_hash,
                index,
                error: error.clone(),
            });

            let invalid = error.kind == TransportErrorKind::InvalidRequest;
            let failure = UploadError::Transport {
                index,
                source: error,
            };
            if invalid {
                Err(fatal(failure))
            } else {
                Err(TaskFailure::Retry(failure))
            }
        }
        Err(panic) => {
            let error = TransportError::network(panic.clone());
            session
                .finish_failure(index, FailureKind::Error, error.clone())
                .map_err(|e| fatal(e.into()))?;
            hooks.dispatch(&HookEvent::UploadChunkError {
                file_hash,
                index,
                error,
            });
            Err(fatal(UploadError::Resolution {
                hook: ValueHook::CustomUploadRequest,
                source: panic.into(),
            }))
        }
    }
}

/// Runs a caller-supplied request. The outer error is a panic message.
async fn send_custom<C>(
    custom: &dyn CustomRequest<C>,
    params: CustomRequestParams<C>,
) -> Result<Result<TransportResponse, TransportError>, String> {
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| custom.send(params)))
        .map_err(|panic| panic_message(&*panic))?;
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(&*panic))
}
