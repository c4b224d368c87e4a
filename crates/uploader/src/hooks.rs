//! Hook dispatch.
//!
//! Two kinds of user callbacks run around the pipeline:
//!
//! - **Notification hooks** ([`HookRegistry`]) observe a stage. A failing or
//!   panicking handler is logged and otherwise ignored.
//! - **Value hooks** ([`ValueFn`]) produce something the pipeline needs, such
//!   as a URL or a request body. Their failures are surfaced as
//!   [`UploadError::Resolution`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use sliceup_transport::{TransportError, TransportResponse};
use tracing::warn;

use crate::error::UploadError;
use crate::types::FileInfo;

/// Error type returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Notification hooks
// ---------------------------------------------------------------------------

/// Pipeline stage a notification hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeFileHash,
    FileHashProgress,
    FileHashSuccess,
    FileHashError,
    BeforeUploadChunk,
    UploadChunkProgress,
    UploadChunkSuccess,
    UploadChunkError,
    BeforeMergeChunk,
    MergeChunkSuccess,
    MergeChunkError,
}

impl HookKind {
    /// Name used when logging a failed hook, e.g. `success uploadChunk`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeFileHash => "before fileHash",
            Self::FileHashProgress => "change fileHash",
            Self::FileHashSuccess => "success fileHash",
            Self::FileHashError => "error fileHash",
            Self::BeforeUploadChunk => "before uploadChunk",
            Self::UploadChunkProgress => "progress uploadChunk",
            Self::UploadChunkSuccess => "success uploadChunk",
            Self::UploadChunkError => "error uploadChunk",
            Self::BeforeMergeChunk => "before mergeChunk",
            Self::MergeChunkSuccess => "success mergeChunk",
            Self::MergeChunkError => "error mergeChunk",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to notification hooks.
#[derive(Debug, Clone)]
pub enum HookEvent {
    BeforeFileHash {
        file: FileInfo,
        chunk_count: usize,
    },
    FileHashProgress {
        file: FileInfo,
        index: usize,
        percent: f64,
    },
    FileHashSuccess {
        file: FileInfo,
        file_hash: String,
    },
    FileHashError {
        file: FileInfo,
        index: usize,
        error: String,
    },
    BeforeUploadChunk {
        file_hash: String,
        index: usize,
    },
    UploadChunkProgress {
        file_hash: String,
        index: usize,
        loaded: u64,
        total: u64,
        percent: f64,
    },
    UploadChunkSuccess {
        file_hash: String,
        index: usize,
        response: TransportResponse,
        /// Chunks in `Success` after this one completed.
        uploaded: usize,
        total: usize,
    },
    UploadChunkError {
        file_hash: String,
        index: usize,
        error: TransportError,
    },
    BeforeMergeChunk {
        file: FileInfo,
        file_hash: String,
    },
    MergeChunkSuccess {
        file: FileInfo,
        file_hash: String,
        response: TransportResponse,
    },
    MergeChunkError {
        file: FileInfo,
        file_hash: String,
        error: TransportError,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            Self::BeforeFileHash { .. } => HookKind::BeforeFileHash,
            Self::FileHashProgress { .. } => HookKind::FileHashProgress,
            Self::FileHashSuccess { .. } => HookKind::FileHashSuccess,
            Self::FileHashError { .. } => HookKind::FileHashError,
            Self::BeforeUploadChunk { .. } => HookKind::BeforeUploadChunk,
            Self::UploadChunkProgress { .. } => HookKind::UploadChunkProgress,
            Self::UploadChunkSuccess { .. } => HookKind::UploadChunkSuccess,
            Self::UploadChunkError { .. } => HookKind::UploadChunkError,
            Self::BeforeMergeChunk { .. } => HookKind::BeforeMergeChunk,
            Self::MergeChunkSuccess { .. } => HookKind::MergeChunkSuccess,
            Self::MergeChunkError { .. } => HookKind::MergeChunkError,
        }
    }
}

/// A notification hook handler.
pub type HookFn = Arc<dyn Fn(&HookEvent) -> Result<(), BoxError> + Send + Sync>;

/// Notification hooks keyed by stage.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookKind, Vec<HookFn>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`. Several handlers per kind run in
    /// registration order.
    pub fn on<F>(&mut self, kind: HookKind, handler: F) -> &mut Self
    where
        F: Fn(&HookEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.entry(kind).or_default().push(Arc::new(handler));
        self
    }

    pub fn has(&self, kind: HookKind) -> bool {
        self.hooks.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Runs every handler registered for the event's stage.
    ///
    /// Never fails: handler errors and panics are logged.
    pub fn dispatch(&self, event: &HookEvent) {
        let kind = event.kind();
        let Some(handlers) = self.hooks.get(&kind) else {
            return;
        };
        for handler in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(hook = %kind, error = %e, "{kind} hook failed"),
                Err(panic) => {
                    warn!(hook = %kind, error = %panic_message(&*panic), "{kind} hook panicked")
                }
            }
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.hooks.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("HookRegistry").field("hooks", &kinds).finish()
    }
}

// ---------------------------------------------------------------------------
// Value hooks
// ---------------------------------------------------------------------------

/// The value-producing hook a resolution error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueHook {
    UploadAction,
    UploadData,
    MergeAction,
    MergeData,
    CheckUpload,
    SkipChunkIndex,
    CustomUploadRequest,
    CustomMergeRequest,
}

impl ValueHook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadAction => "uploadAction",
            Self::UploadData => "uploadData",
            Self::MergeAction => "mergeAction",
            Self::MergeData => "mergeData",
            Self::CheckUpload => "checkUpload",
            Self::SkipChunkIndex => "skipChunkIndex",
            Self::CustomUploadRequest => "customUploadRequest",
            Self::CustomMergeRequest => "customMergeRequest",
        }
    }
}

impl fmt::Display for ValueHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boxed future produced by a [`ValueFn`].
pub type ValueFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

/// A value-producing callback taking context `C`.
pub type ValueFn<C, T> = Arc<dyn Fn(C) -> ValueFuture<T> + Send + Sync>;

/// Wraps a synchronous callback.
pub fn value_fn<C, T, F>(f: F) -> ValueFn<C, T>
where
    F: Fn(C) -> Result<T, BoxError> + Send + Sync + 'static,
    T: Send + 'static,
{
    Arc::new(move |ctx| Box::pin(std::future::ready(f(ctx))))
}

/// Wraps an asynchronous callback.
pub fn async_value_fn<C, T, F, Fut>(f: F) -> ValueFn<C, T>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Invokes a value hook, turning an error, a rejected future or a panic into
/// [`UploadError::Resolution`].
pub async fn resolve_value<C, T>(hook: ValueHook, f: &ValueFn<C, T>, ctx: C) -> Result<T, UploadError> {
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))).map_err(|panic| {
        UploadError::Resolution {
            hook,
            source: panic_message(&*panic).into(),
        }
    })?;

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(UploadError::Resolution { hook, source }),
        Err(panic) => Err(UploadError::Resolution {
            hook,
            source: panic_message(&*panic).into(),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn progress_event() -> HookEvent {
        HookEvent::UploadChunkProgress {
            file_hash: "abc".into(),
            index: 0,
            loaded: 5,
            total: 10,
            percent: 50.0,
        }
    }

    #[test]
    fn dispatch_without_hooks_is_noop() {
        HookRegistry::new().dispatch(&progress_event());
    }

    #[test]
    fn dispatch_runs_matching_handlers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            hooks.on(HookKind::UploadChunkProgress, move |event| {
                if let HookEvent::UploadChunkProgress { percent, .. } = event {
                    seen.lock().unwrap().push((tag, *percent));
                }
                Ok(())
            });
        }
        let other = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&other);
        hooks.on(HookKind::MergeChunkSuccess, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.dispatch(&progress_event());

        assert_eq!(*seen.lock().unwrap(), vec![("first", 50.0), ("second", 50.0)]);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert!(hooks.has(HookKind::UploadChunkProgress));
        assert!(!hooks.has(HookKind::BeforeFileHash));
    }

    #[test]
    fn failing_and_panicking_hooks_are_contained() {
        let after = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookRegistry::new();
        hooks.on(HookKind::UploadChunkProgress, |_| Err("nope".into()));
        hooks.on(HookKind::UploadChunkProgress, |_| panic!("hook exploded"));
        let a = Arc::clone(&after);
        hooks.on(HookKind::UploadChunkProgress, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hooks.dispatch(&progress_event());
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_kind_names() {
        assert_eq!(HookKind::UploadChunkSuccess.to_string(), "success uploadChunk");
        assert_eq!(progress_event().kind(), HookKind::UploadChunkProgress);
    }

    #[tokio::test]
    async fn resolve_sync_and_async_values() {
        let sync: ValueFn<usize, String> = value_fn(|i| Ok(format!("/upload/{i}")));
        assert_eq!(
            resolve_value(ValueHook::UploadAction, &sync, 3).await.unwrap(),
            "/upload/3"
        );

        let asynchronous: ValueFn<usize, usize> = async_value_fn(|i| async move {
            tokio::task::yield_now().await;
            Ok(i * 2)
        });
        assert_eq!(
            resolve_value(ValueHook::UploadData, &asynchronous, 21)
                .await
                .unwrap(),
            42
        );
    }

    #[tokio::test]
    async fn resolve_surfaces_errors() {
        let failing: ValueFn<(), String> = value_fn(|_| Err("no url for you".into()));
        let err = resolve_value(ValueHook::MergeAction, &failing, ()).await.unwrap_err();
        match err {
            UploadError::Resolution { hook, source } => {
                assert_eq!(hook, ValueHook::MergeAction);
                assert_eq!(source.to_string(), "no url for you");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let rejected: ValueFn<(), String> =
            async_value_fn(|_| async { Err::<String, BoxError>("rejected".into()) });
        let err = resolve_value(ValueHook::MergeData, &rejected, ()).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Resolution {
                hook: ValueHook::MergeData,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn resolve_catches_panics() {
        let sync_panic: ValueFn<(), bool> = value_fn(|_| panic!("sync boom"));
        let err = resolve_value(ValueHook::CheckUpload, &sync_panic, ()).await.unwrap_err();
        assert!(err.to_string().contains("sync boom"), "{err}");

        let async_panic: ValueFn<(), bool> = async_value_fn(|_| async {
            tokio::task::yield_now().await;
            if true {
                panic!("async boom");
            }
            Ok(false)
        });
        let err = resolve_value(ValueHook::CheckUpload, &async_panic, ()).await.unwrap_err();
        assert!(err.to_string().contains("async boom"), "{err}");
    }
}
