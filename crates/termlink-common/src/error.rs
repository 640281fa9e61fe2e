//! Error kinds shared across the wire and SDK layers.

use thiserror::Error;

/// Errors surfaced by requests against the terminal gateway.
///
/// Request-scoped: an `ApiError` is returned to the caller of the failing
/// request and never mutates shared state.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// A request field failed a local precondition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The transport was down when the request deadline elapsed.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A deadline expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server reported no such entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The server throttled the request.
    #[error("Too many requests: {message} (retry after {retry_after_seconds:?}s)")]
    TooManyRequests {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// The operation was still pending when the connection closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Unknown server-side failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Maps a server error response onto the local kind set.
    ///
    /// `error_id` is the server's error identifier string; unrecognized
    /// identifiers collapse into `Internal`.
    pub fn from_server(error_id: &str, message: String, retry_after_seconds: Option<u64>) -> Self {
        match error_id {
            "ValidationError" => ApiError::Validation(message),
            "NotFoundError" => ApiError::NotFound(message),
            "UnauthorizedError" => ApiError::Unauthorized(message),
            "NotConnectedError" => ApiError::NotConnected(message),
            "TimeoutError" => ApiError::Timeout(message),
            "TooManyRequestsError" => ApiError::TooManyRequests {
                message,
                retry_after_seconds,
            },
            _ => ApiError::Internal(message),
        }
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_server_maps_known_ids() {
        assert!(matches!(
            ApiError::from_server("ValidationError", "bad field".into(), None),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from_server("NotFoundError", "no account".into(), None),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from_server("UnauthorizedError", "bad token".into(), None),
            ApiError::Unauthorized(_)
        ));
    }

    #[test]
    fn test_from_server_unknown_is_internal() {
        assert!(matches!(
            ApiError::from_server("SomethingNew", "?".into(), None),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_throttle_carries_retry_hint() {
        let err = ApiError::from_server("TooManyRequestsError", "slow down".into(), Some(30));
        match err {
            ApiError::TooManyRequests {
                retry_after_seconds,
                ..
            } => assert_eq!(retry_after_seconds, Some(30)),
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }
}
