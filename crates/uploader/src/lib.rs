//! Resumable chunked file uploads.
//!
//! [`SliceUploader`] splits a file into fixed-size chunks, hashes it, uploads
//! the chunks concurrently with per-chunk retry, and finally asks the server
//! to merge them under the file hash. Uploads can be cancelled and resumed
//! without re-hashing; only chunks that are not yet on the server are sent
//! again.

pub mod config;
pub mod error;
pub mod hooks;
pub mod options;
pub mod session;
pub mod types;
pub mod uploader;

pub use config::UploadConfig;
pub use error::UploadError;
pub use hooks::{
    BoxError, HookEvent, HookFn, HookKind, HookRegistry, ValueFn, ValueFuture, ValueHook,
    async_value_fn, resolve_value, value_fn,
};
pub use options::{
    Action, CustomRequest, CustomRequestParams, MergeData, RequestData, UploadData, UploadOptions,
};
pub use session::UploadSession;
pub use types::{ChunkContext, FileInfo, MergeContext, Phase, UploadChunk, UploaderState};
pub use uploader::SliceUploader;

pub use sliceup_transfer::{ChunkStatus, HashAlgorithm, UploadFile};
pub use sliceup_transport::{
    ReqwestTransport, RequestBody, Transport, TransportError, TransportErrorKind,
    TransportResponse,
};
