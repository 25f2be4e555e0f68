//! Error taxonomy of the session core.

use herald_credentials::StorageError;
use herald_protocol::ConnectionState;
use tokio_tungstenite::tungstenite;

/// Failures talking to the messaging network.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("device logged out")]
    LoggedOut,

    #[error("gateway error {code}: {message}")]
    Rejected { code: i32, message: String },

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("unrecoverable transport fault: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Returns `true` when reconnecting may succeed.
    ///
    /// A logged-out device, a malformed gateway address, and gateway
    /// rejections of the request itself are terminal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LoggedOut | Self::Fatal(_) => false,
            Self::Ws(tungstenite::Error::Url(_)) => false,
            Self::Rejected { code, .. } => *code == 429 || *code >= 500,
            _ => true,
        }
    }
}

/// Errors surfaced to callers of the session controller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{operation} not permitted while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "request timed out");
        assert_eq!(TransportError::Closed.to_string(), "connection closed");
        let err = TransportError::Rejected {
            code: 503,
            message: "busy".into(),
        };
        assert_eq!(err.to_string(), "gateway error 503: busy");
    }

    #[test]
    fn recoverable_classification() {
        assert!(TransportError::Timeout.is_recoverable());
        assert!(TransportError::Closed.is_recoverable());
        assert!(
            TransportError::Rejected {
                code: 503,
                message: String::new()
            }
            .is_recoverable()
        );
        assert!(
            !TransportError::Rejected {
                code: 400,
                message: String::new()
            }
            .is_recoverable()
        );
        assert!(!TransportError::LoggedOut.is_recoverable());
        assert!(!TransportError::Fatal("boom".into()).is_recoverable());
    }

    #[test]
    fn invalid_state_display() {
        let err = SessionError::InvalidState {
            operation: "request_pairing",
            state: ConnectionState::Active,
        };
        assert_eq!(err.to_string(), "request_pairing not permitted while active");
    }
}
