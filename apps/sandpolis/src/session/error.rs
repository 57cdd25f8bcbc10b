use state_tree::{StateError, WireError};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not reach server: {0}")]
    ConnectFailed(#[from] TransportError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request {id} timed out")]
    RequestTimeout { id: i32 },
    #[error("request {id} was superseded by a newer request with the same id")]
    Superseded { id: i32 },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("handshake has not completed")]
    HandshakeIncomplete,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("expected {expected} but received {received}")]
    UnexpectedResponse {
        expected: &'static str,
        received: &'static str,
    },
    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Coarse classification for presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The server could not be reached; retry the connection.
    Unreachable,
    /// The server refused the credentials or the operation.
    Rejected,
    /// A local timer expired; the operation may be retried.
    TimedOut,
    /// The session is gone.
    Closed,
    /// The peer sent something this build cannot accept.
    Protocol,
    /// The caller passed something invalid.
    Caller,
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::ConnectFailed(_) => ErrorCategory::Unreachable,
            SessionError::AuthenticationFailed(_) | SessionError::Rejected(_) => {
                ErrorCategory::Rejected
            }
            SessionError::RequestTimeout { .. } => ErrorCategory::TimedOut,
            SessionError::ConnectionClosed => ErrorCategory::Closed,
            SessionError::Superseded { .. }
            | SessionError::HandshakeFailed(_)
            | SessionError::UnexpectedResponse { .. }
            | SessionError::Wire(_) => ErrorCategory::Protocol,
            SessionError::HandshakeIncomplete
            | SessionError::MessageTooLarge { .. }
            | SessionError::State(_) => ErrorCategory::Caller,
        }
    }

    /// True for failures of the connection rather than of one operation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Unreachable | ErrorCategory::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn categories_separate_reachability_from_refusal() {
        let unreachable = SessionError::ConnectFailed(TransportError::Tls("bad cert".into()));
        assert_eq!(unreachable.category(), ErrorCategory::Unreachable);
        assert!(unreachable.is_transport());

        let refused = SessionError::AuthenticationFailed("invalid credentials".into());
        assert_eq!(refused.category(), ErrorCategory::Rejected);
        assert!(!refused.is_transport());

        let timeout = SessionError::RequestTimeout { id: 4 };
        assert_eq!(timeout.category(), ErrorCategory::TimedOut);
        assert!(!timeout.is_transport());

        assert_eq!(SessionError::ConnectionClosed.category(), ErrorCategory::Closed);
        assert_eq!(
            SessionError::from(StateError::EmptyPath).category(),
            ErrorCategory::Caller
        );
    }
}
