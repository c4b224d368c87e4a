use std::fmt;

use crate::TransferError;
use crate::chunker::ChunkSlice;

/// Upload state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Success,
    Error,
    Aborted,
    TimedOut,
}

impl ChunkStatus {
    /// Returns `true` for the three failed terminal states.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Aborted | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which failed terminal state an upload attempt ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Aborted,
    TimedOut,
}

impl From<FailureKind> for ChunkStatus {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Error => ChunkStatus::Error,
            FailureKind::Aborted => ChunkStatus::Aborted,
            FailureKind::TimedOut => ChunkStatus::TimedOut,
        }
    }
}

/// One contiguous slice of the source file plus its upload state.
///
/// `R` is the response recorded on success and `E` the failure recorded on
/// error. Once the chunk leaves `Pending`/`Uploading` exactly one of them is
/// populated; both are cleared on every fresh `Uploading` transition. The one
/// exception is a chunk marked with [`skip`](Self::skip): it is `Success`
/// without a response because no request was sent for it.
#[derive(Debug, Clone)]
pub struct Chunk<R, E> {
    slice: ChunkSlice,
    status: ChunkStatus,
    response: Option<R>,
    failure: Option<E>,
    progress: f64,
}

impl<R, E> Chunk<R, E> {
    /// Creates a pending chunk for `slice`.
    pub fn new(slice: ChunkSlice) -> Self {
        Self {
            slice,
            status: ChunkStatus::Pending,
            response: None,
            failure: None,
            progress: 0.0,
        }
    }

    pub fn slice(&self) -> ChunkSlice {
        self.slice
    }

    /// Positional identity of the chunk within its file.
    pub fn index(&self) -> usize {
        self.slice.index
    }

    pub fn offset(&self) -> u64 {
        self.slice.offset
    }

    pub fn size(&self) -> u64 {
        self.slice.size
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn response(&self) -> Option<&R> {
        self.response.as_ref()
    }

    pub fn failure(&self) -> Option<&E> {
        self.failure.as_ref()
    }

    /// Upload progress in percent (0–100).
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Returns `true` if the chunk may be (re)uploaded without re-hashing.
    ///
    /// Aborted and timed-out chunks count as resumable so that a cancelled
    /// upload picks them up again on resume.
    pub fn is_resumable(&self) -> bool {
        self.status == ChunkStatus::Pending || self.status.is_failure()
    }

    /// Enters `Uploading`, resetting progress and clearing the previous outcome.
    pub fn begin_upload(&mut self) -> Result<(), TransferError> {
        if !self.is_resumable() {
            return Err(self.invalid(ChunkStatus::Uploading));
        }
        self.status = ChunkStatus::Uploading;
        self.progress = 0.0;
        self.response = None;
        self.failure = None;
        Ok(())
    }

    /// Records a successful upload.
    pub fn succeed(&mut self, response: R) -> Result<(), TransferError> {
        if self.status != ChunkStatus::Uploading {
            return Err(self.invalid(ChunkStatus::Success));
        }
        self.status = ChunkStatus::Success;
        self.progress = 100.0;
        self.response = Some(response);
        Ok(())
    }

    /// Records a failed upload attempt.
    pub fn fail(&mut self, kind: FailureKind, failure: E) -> Result<(), TransferError> {
        if self.status != ChunkStatus::Uploading {
            return Err(self.invalid(kind.into()));
        }
        self.status = kind.into();
        self.failure = Some(failure);
        Ok(())
    }

    /// Marks a chunk the server already holds as done, without a response.
    pub fn skip(&mut self) -> Result<(), TransferError> {
        if !self.is_resumable() {
            return Err(self.invalid(ChunkStatus::Success));
        }
        self.status = ChunkStatus::Success;
        self.progress = 100.0;
        self.failure = None;
        Ok(())
    }

    /// Updates progress while uploading. Never moves backwards.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set_progress(&mut self, percent: f64) -> bool {
        if self.status != ChunkStatus::Uploading || !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    fn invalid(&self, to: ChunkStatus) -> TransferError {
        TransferError::InvalidTransition {
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestChunk = Chunk<String, String>;

    fn chunk() -> TestChunk {
        Chunk::new(ChunkSlice {
            index: 3,
            offset: 30,
            size: 10,
        })
    }

    #[test]
    fn new_chunk_is_pending_and_resumable() {
        let c = chunk();
        assert_eq!(c.status(), ChunkStatus::Pending);
        assert!(c.is_resumable());
        assert_eq!(c.index(), 3);
        assert_eq!(c.offset(), 30);
        assert_eq!(c.size(), 10);
        assert!(c.response().is_none());
        assert!(c.failure().is_none());
    }

    #[test]
    fn success_path_records_response() {
        let mut c = chunk();
        c.begin_upload().unwrap();
        assert_eq!(c.status(), ChunkStatus::Uploading);
        assert!(!c.is_resumable());
        c.succeed("ok".into()).unwrap();
        assert_eq!(c.status(), ChunkStatus::Success);
        assert_eq!(c.response().map(String::as_str), Some("ok"));
        assert!(c.failure().is_none());
        assert_eq!(c.progress(), 100.0);
    }

    #[test]
    fn success_is_terminal() {
        let mut c = chunk();
        c.begin_upload().unwrap();
        c.succeed("ok".into()).unwrap();
        assert!(!c.is_resumable());
        let err = c.begin_upload().unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidTransition {
                from: ChunkStatus::Success,
                to: ChunkStatus::Uploading
            }
        ));
        assert!(c.skip().is_err());
    }

    #[test]
    fn failures_are_resumable_and_cleared_on_retry() {
        for kind in [FailureKind::Error, FailureKind::Aborted, FailureKind::TimedOut] {
            let mut c = chunk();
            c.begin_upload().unwrap();
            c.set_progress(40.0);
            c.fail(kind, "boom".into()).unwrap();
            assert_eq!(c.status(), ChunkStatus::from(kind));
            assert!(c.status().is_failure());
            assert!(c.is_resumable());
            assert_eq!(c.failure().map(String::as_str), Some("boom"));
            assert!(c.response().is_none());

            c.begin_upload().unwrap();
            assert!(c.failure().is_none());
            assert!(c.response().is_none());
            assert_eq!(c.progress(), 0.0);
        }
    }

    #[test]
    fn outcome_requires_uploading() {
        let mut c = chunk();
        assert!(c.succeed("x".into()).is_err());
        assert!(c.fail(FailureKind::Error, "x".into()).is_err());
        assert_eq!(c.status(), ChunkStatus::Pending);
    }

    #[test]
    fn uploading_twice_is_rejected() {
        let mut c = chunk();
        c.begin_upload().unwrap();
        assert!(c.begin_upload().is_err());
    }

    #[test]
    fn progress_is_monotonic_while_uploading() {
        let mut c = chunk();
        assert!(!c.set_progress(10.0), "pending chunk ignores progress");

        c.begin_upload().unwrap();
        assert!(c.set_progress(25.0));
        assert!(!c.set_progress(20.0));
        assert_eq!(c.progress(), 25.0);
        assert!(c.set_progress(250.0));
        assert_eq!(c.progress(), 100.0);
        assert!(!c.set_progress(f64::NAN));
    }

    #[test]
    fn skip_marks_success_without_response() {
        let mut c = chunk();
        c.skip().unwrap();
        assert_eq!(c.status(), ChunkStatus::Success);
        assert!(c.response().is_none());
        assert!(c.failure().is_none());
    }

    #[test]
    fn status_display() {
        assert_eq!(ChunkStatus::TimedOut.to_string(), "timed_out");
        assert_eq!(ChunkStatus::Pending.to_string(), "pending");
    }
}
