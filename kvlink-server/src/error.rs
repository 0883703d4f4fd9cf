//! Server error types.

use kvlink_protocol::ErrorCode;
use kvlink_store::StoreError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] kvlink_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] kvlink_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(&'static str),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("no Tokio runtime available to run the server")]
    NoRuntime,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Store(StoreError::Closed) => ErrorCode::StoreClosed,
            ServerError::Store(_) => ErrorCode::InternalError,
            ServerError::Config(_) => ErrorCode::InternalError,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            ServerError::MethodNotAllowed(_) => ErrorCode::MethodNotAllowed,
            ServerError::AuthFailed(_) => ErrorCode::AuthFailed,
            ServerError::AccessDenied(_) => ErrorCode::AccessDenied,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::NoRuntime => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ServerError::Store(StoreError::Closed).error_code(),
            ErrorCode::StoreClosed
        );
        assert!(ServerError::Store(StoreError::Closed).is_retryable());
        assert_eq!(
            ServerError::AccessDenied("read-only access".into()).error_code(),
            ErrorCode::AccessDenied
        );
        assert!(!ServerError::NotFound("k".into()).is_retryable());
        assert_eq!(
            ServerError::MethodNotAllowed("put").error_code(),
            ErrorCode::MethodNotAllowed
        );
    }
}
