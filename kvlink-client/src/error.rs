//! Client error types.

use kvlink_core::{ConfigError, ErrorKind, OriginTag};
use kvlink_protocol::{ErrorCode, ResponseError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] kvlink_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {code} - {message}")]
    ServerError {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("method not in manifest: {0}")]
    MethodNotInManifest(String),

    #[error("no Tokio runtime available to run the session")]
    NoRuntime,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::NotConnected => true,
            ClientError::ServerError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Server error code, if the server answered with an error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Where a failure during a connection attempt is reported from.
    pub fn origin(&self) -> (OriginTag, ErrorKind) {
        match self {
            ClientError::Protocol(_) | ClientError::Json(_) => {
                (OriginTag::RpcStream, ErrorKind::Protocol)
            }
            ClientError::ServerError {
                code: ErrorCode::AuthFailed | ErrorCode::AccessDenied,
                ..
            } => (OriginTag::Database, ErrorKind::Access),
            ClientError::ServerError { .. } => (OriginTag::Database, ErrorKind::Protocol),
            ClientError::Config(_) => (OriginTag::LevelServer, ErrorKind::Config),
            _ => (OriginTag::TcpClient, ErrorKind::Transport),
        }
    }
}

impl From<ResponseError> for ClientError {
    fn from(err: ResponseError) -> Self {
        ClientError::ServerError {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        }
    }
}
