//! Caller-supplied behaviour that does not fit in [`UploadConfig`](crate::UploadConfig):
//! URL and body callbacks, existence checks, custom requests and hooks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sliceup_transport::{ProgressFn, RequestBody, TransportFuture};
use tokio_util::sync::CancellationToken;

use crate::hooks::{HookRegistry, ValueFn};
use crate::types::{ChunkContext, MergeContext};

/// Where a request goes: a fixed URL or one computed per call.
pub enum Action<C> {
    Url(String),
    Function(ValueFn<C, String>),
}

impl<C> Clone for Action<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Url(url) => Self::Url(url.clone()),
            Self::Function(f) => Self::Function(Arc::clone(f)),
        }
    }
}

impl<C> fmt::Debug for Action<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// What a request carries: static form fields or a body computed per call.
///
/// Static upload fields are sent as multipart alongside the chunk; static
/// merge fields are sent as a form together with the file hash.
pub enum RequestData<C> {
    Fields(BTreeMap<String, String>),
    Function(ValueFn<C, RequestBody>),
}

impl<C> Clone for RequestData<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Fields(fields) => Self::Fields(fields.clone()),
            Self::Function(f) => Self::Function(Arc::clone(f)),
        }
    }
}

impl<C> fmt::Debug for RequestData<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

pub type UploadData = RequestData<ChunkContext>;
pub type MergeData = RequestData<MergeContext>;

/// A request handed to a [`CustomRequest`] in place of the transport.
pub struct CustomRequestParams<C> {
    /// Resolved URL, if one was configured.
    pub url: Option<String>,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
    pub context: C,
    /// Report `(loaded, total)` while sending.
    pub progress: ProgressFn,
    /// Cancelled when the request should stop.
    pub abort: CancellationToken,
}

/// Replaces the transport for upload or merge requests.
///
/// The returned error is classified the same way transport errors are, so a
/// custom request takes part in retry and cancellation like a built-in one.
pub trait CustomRequest<C>: Send + Sync {
    fn send(&self, params: CustomRequestParams<C>) -> TransportFuture<'_>;
}

/// Callbacks and hooks for a [`SliceUploader`](crate::SliceUploader).
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub(crate) upload_action: Option<Action<ChunkContext>>,
    pub(crate) upload_data: Option<UploadData>,
    pub(crate) merge_action: Option<Action<MergeContext>>,
    pub(crate) merge_data: Option<MergeData>,
    pub(crate) check_upload: Option<ValueFn<MergeContext, bool>>,
    pub(crate) skip_chunk_index: Option<ValueFn<MergeContext, Vec<usize>>>,
    pub(crate) custom_upload_request: Option<Arc<dyn CustomRequest<ChunkContext>>>,
    pub(crate) custom_merge_request: Option<Arc<dyn CustomRequest<MergeContext>>>,
    pub(crate) hooks: HookRegistry,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `upload_url` from the configuration.
    pub fn upload_action(mut self, action: Action<ChunkContext>) -> Self {
        self.upload_action = Some(action);
        self
    }

    /// Overrides `upload_fields` from the configuration.
    pub fn upload_data(mut self, data: UploadData) -> Self {
        self.upload_data = Some(data);
        self
    }

    /// Overrides `merge_url` from the configuration.
    pub fn merge_action(mut self, action: Action<MergeContext>) -> Self {
        self.merge_action = Some(action);
        self
    }

    /// Overrides `merge_fields` from the configuration.
    pub fn merge_data(mut self, data: MergeData) -> Self {
        self.merge_data = Some(data);
        self
    }

    /// Asks whether the server already holds the whole file. When it
    /// answers `true` nothing is uploaded or merged.
    pub fn check_upload(mut self, check: ValueFn<MergeContext, bool>) -> Self {
        self.check_upload = Some(check);
        self
    }

    /// Returns indices of chunks the server already holds.
    pub fn skip_chunk_index(mut self, skip: ValueFn<MergeContext, Vec<usize>>) -> Self {
        self.skip_chunk_index = Some(skip);
        self
    }

    pub fn custom_upload_request(mut self, request: Arc<dyn CustomRequest<ChunkContext>>) -> Self {
        self.custom_upload_request = Some(request);
        self
    }

    pub fn custom_merge_request(mut self, request: Arc<dyn CustomRequest<MergeContext>>) -> Self {
        self.custom_merge_request = Some(request);
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("upload_action", &self.upload_action)
            .field("upload_data", &self.upload_data)
            .field("merge_action", &self.merge_action)
            .field("merge_data", &self.merge_data)
            .field("check_upload", &self.check_upload.is_some())
            .field("skip_chunk_index", &self.skip_chunk_index.is_some())
            .field("custom_upload_request", &self.custom_upload_request.is_some())
            .field("custom_merge_request", &self.custom_merge_request.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}
