//! JSON message types carried inside frames.

use crate::error::ErrorCode;
use crate::manifest::Manifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// RPC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Session management
    Hello,
    Auth,
    Deauth,
    Ping,

    // Store operations
    Get,
    Put,
    Del,
    Batch,
    Range,
}

impl Operation {
    /// All store operations, in manifest order.
    pub const STORE_METHODS: [Operation; 5] = [
        Operation::Get,
        Operation::Put,
        Operation::Del,
        Operation::Batch,
        Operation::Range,
    ];

    /// Method name as seen by hooks and manifests.
    pub fn method_name(&self) -> &'static str {
        match self {
            Operation::Hello => "hello",
            Operation::Auth => "auth",
            Operation::Deauth => "deauth",
            Operation::Ping => "ping",
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Del => "del",
            Operation::Batch => "batch",
            Operation::Range => "range",
        }
    }

    /// Parses a method name (case-insensitive).
    pub fn from_method_name(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "hello" => Operation::Hello,
            "auth" => Operation::Auth,
            "deauth" => Operation::Deauth,
            "ping" => Operation::Ping,
            "get" => Operation::Get,
            "put" => Operation::Put,
            "del" => Operation::Del,
            "batch" => Operation::Batch,
            "range" => Operation::Range,
            _ => return None,
        };
        Some(op)
    }

    /// Session operations are always available and never listed in a manifest.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            Operation::Hello | Operation::Auth | Operation::Deauth | Operation::Ping
        )
    }

    /// Whether the operation mutates the store.
    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Put | Operation::Del | Operation::Batch)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

/// Any message that can travel on the RPC stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notice(Notice),
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation ID, unique per stream.
    pub id: u64,
    pub op: Operation,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, op: Operation) -> Self {
        Self {
            id,
            op,
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Request parameters flattened into a positional argument list for hooks.
    pub fn args(&self) -> Vec<Value> {
        match &self.params {
            Value::Object(map) if map.is_empty() => Vec::new(),
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.is_retryable(),
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Response metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
}

impl ResponseMeta {
    pub fn now() -> Self {
        Self {
            server_time: Some(Utc::now()),
        }
    }

    fn is_empty(&self) -> bool {
        self.server_time.is_none()
    }
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request this answers.
    pub id: u64,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, skip_serializing_if = "ResponseMeta::is_empty")]
    pub meta: ResponseMeta,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
            meta: ResponseMeta::default(),
        }
    }

    pub fn error(id: u64, error: ResponseError) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
            meta: ResponseMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Converts into the result value or the carried error.
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.status {
            ResponseStatus::Ok => Ok(self.result.unwrap_or(Value::Null)),
            ResponseStatus::Error => Err(self.error.unwrap_or_else(|| {
                ResponseError::new(ErrorCode::InternalError, "error response without details")
            })),
        }
    }
}

/// Unsolicited server-to-client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub event: NoticeEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Notice {
    pub fn new(event: NoticeEvent) -> Self {
        Self {
            event,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Notice kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeEvent {
    /// The server's storage engine closed; the stream is about to end.
    StoreClosed,
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Result for HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server_name: String,
    pub server_version: String,
    /// Methods the server exposes on this stream.
    pub manifest: Manifest,
}

/// Parameters for AUTH. Credentials are opaque to the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub credentials: Value,
}

/// Result for AUTH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// The user value the authenticator attached to the session.
    pub user: Value,
}

/// Parameters for GET and DEL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParams {
    pub key: String,
}

/// Result for GET.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResult {
    pub value: String,
}

/// Parameters for PUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParams {
    pub key: String,
    pub value: String,
}

/// One entry of a BATCH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchOp {
    Put { key: String, value: String },
    Del { key: String },
}

/// Parameters for BATCH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchParams {
    pub ops: Vec<BatchOp>,
}

/// Parameters for RANGE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeParams {
    /// Inclusive lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<String>,
    /// Inclusive upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

/// A key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

/// Result for RANGE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeResult {
    pub entries: Vec<Entry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let msg = Message::Request(Request::new(1, Operation::Ping));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""op":"PING""#));
    }

    #[test]
    fn test_response_error_serialization() {
        let err = ResponseError::new(ErrorCode::NotFound, "key not found").with_detail("key", "a");
        let json = serde_json::to_string(&Message::Response(Response::error(3, err))).unwrap();
        assert!(json.contains(r#""type":"response""#));
        assert!(json.contains(r#""code":"NOT_FOUND""#));
        assert!(json.contains(r#""retryable":false"#));
    }

    #[test]
    fn test_notice_parses() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"notice","event":"store_closed"}"#).unwrap();
        match msg {
            Message::Notice(notice) => assert_eq!(notice.event, NoticeEvent::StoreClosed),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_batch_op_tagging() {
        let ops = vec![
            BatchOp::Put {
                key: "a".into(),
                value: "1".into(),
            },
            BatchOp::Del { key: "b".into() },
        ];
        let json = serde_json::to_value(BatchParams { ops: ops.clone() }).unwrap();
        assert_eq!(json["ops"][0]["type"], "put");
        assert_eq!(json["ops"][1]["type"], "del");

        let parsed: BatchParams = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.ops, ops);
    }

    #[test]
    fn test_into_result() {
        let ok = Response::ok(1, serde_json::json!({"value": "x"}));
        assert_eq!(ok.into_result().unwrap()["value"], "x");

        let err = Response::error(2, ResponseError::new(ErrorCode::AccessDenied, "read-only"));
        assert_eq!(err.into_result().unwrap_err().code, ErrorCode::AccessDenied);
    }

    #[test]
    fn test_method_names() {
        for op in Operation::STORE_METHODS {
            assert_eq!(Operation::from_method_name(op.method_name()), Some(op));
            assert!(!op.is_session());
        }
        assert_eq!(Operation::from_method_name("PUT"), Some(Operation::Put));
        assert_eq!(Operation::from_method_name("createReadStream"), None);
        assert!(Operation::Batch.is_write());
        assert!(!Operation::Range.is_write());
    }

    #[test]
    fn test_request_args() {
        let req = Request::new(1, Operation::Get).with_params(serde_json::json!({"key": "k"}));
        assert_eq!(req.args(), vec![serde_json::json!({"key": "k"})]);
        assert!(Request::new(2, Operation::Ping).args().is_empty());
    }
}
