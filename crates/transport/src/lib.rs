//! HTTP transport for chunk uploads and merge requests.
//!
//! The uploader talks to the network only through the [`Transport`] trait so
//! tests can substitute an in-memory implementation. [`ReqwestTransport`] is
//! the default implementation.

pub mod client;
pub mod error;
pub mod request;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use client::ReqwestTransport;
pub use error::{TransportError, TransportErrorKind};
pub use request::{
    APPLICATION_JSON, CONTENT_TYPE, FORM_URLENCODED, FilePart, MultipartForm, RequestBody,
    TransportRequest, TransportResponse,
};

/// Upload progress callback: `(bytes sent, bytes total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Sends one HTTP request.
///
/// Implementations resolve with the response for any 2xx status and with a
/// classified [`TransportError`] otherwise. Once `abort` is cancelled the
/// request settles with [`TransportErrorKind::Aborted`].
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
        progress: Option<ProgressFn>,
        abort: CancellationToken,
    ) -> TransportFuture<'_>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(
        &self,
        request: TransportRequest,
        progress: Option<ProgressFn>,
        abort: CancellationToken,
    ) -> TransportFuture<'_> {
        (**self).send(request, progress, abort)
    }
}
