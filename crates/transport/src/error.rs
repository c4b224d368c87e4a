use std::fmt;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Connection failure, DNS failure, reset, or an unreadable response.
    Network,
    /// The server answered with a non-2xx status.
    BadResponse,
    /// The per-request timeout elapsed.
    Timeout,
    /// The caller's abort token fired.
    Aborted,
    /// The request could not be built (bad URL, method or header).
    InvalidRequest,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::BadResponse => "bad response",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::InvalidRequest => "invalid request",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request, classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// HTTP status, when the server answered.
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout() -> Self {
        Self::new(TransportErrorKind::Timeout, "request timed out")
    }

    pub fn aborted() -> Self {
        Self::new(TransportErrorKind::Aborted, "request aborted")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    pub fn bad_response(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::BadResponse,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == TransportErrorKind::Aborted
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout()
        } else if e.is_builder() {
            Self::invalid_request(e.to_string())
        } else if let Some(status) = e.status() {
            Self::bad_response(status.as_u16(), e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_status() {
        let e = TransportError::bad_response(503, "unavailable");
        assert_eq!(e.to_string(), "bad response error (HTTP 503): unavailable");
        assert_eq!(
            TransportError::aborted().to_string(),
            "aborted error: request aborted"
        );
    }

    #[test]
    fn constructors_classify() {
        assert_eq!(TransportError::timeout().kind, TransportErrorKind::Timeout);
        assert!(TransportError::aborted().is_aborted());
        assert_eq!(TransportError::network("x").status, None);
    }
}
