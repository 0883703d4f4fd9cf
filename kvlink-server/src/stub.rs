//! Server-side RPC stub.
//!
//! One stub is shared by every connection of a running server. It owns a
//! handle on the store, the server's manifest and the hooks, and turns each
//! decoded request into exactly one response. Hook rejections and store
//! failures become error responses; they never close the connection.

use crate::error::ServerError;
use crate::hooks::Hooks;
use crate::session::ConnectionSession;
use kvlink_protocol::message::{
    AuthParams, AuthResult, BatchOp, BatchParams, Entry, GetResult, HelloParams, HelloResult,
    KeyParams, PutParams, RangeParams, RangeResult,
};
use kvlink_protocol::{
    Manifest, Operation, Request, Response, ResponseError, ResponseMeta, PROTOCOL_VERSION,
};
use kvlink_store::{RangeOptions, Store, WriteOp};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// Name and version reported in HELLO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "kvlink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Dispatches requests to the store.
pub struct ServerStub {
    store: Arc<dyn Store>,
    manifest: Manifest,
    hooks: Hooks,
    info: ServerInfo,
}

impl ServerStub {
    pub fn new(store: Arc<dyn Store>, manifest: Manifest, hooks: Hooks) -> Self {
        Self {
            store,
            manifest,
            hooks,
            info: ServerInfo::default(),
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Handles a request and returns its response.
    pub fn handle(&self, session: &mut ConnectionSession, request: &Request) -> Response {
        session.record_request();

        let response = match self.dispatch(session, request) {
            Ok(value) => Response::ok(request.id, value),
            Err(e) => {
                tracing::debug!(
                    "[{}] {} (id={}) failed: {}",
                    session.remote_addr,
                    request.op,
                    request.id,
                    e
                );
                Response::error(request.id, ResponseError::new(e.error_code(), e.to_string()))
            }
        };
        response.with_meta(ResponseMeta::now())
    }

    fn dispatch(
        &self,
        session: &mut ConnectionSession,
        request: &Request,
    ) -> Result<Value, ServerError> {
        let op = request.op;
        if !op.is_session() {
            if !self.manifest.allows(op) {
                return Err(ServerError::MethodNotAllowed(op.method_name()));
            }
            self.hooks
                .check_access(session.user(), op.method_name(), &request.args())
                .map_err(ServerError::AccessDenied)?;
        }

        match op {
            Operation::Hello => self.handle_hello(session, &request.params),
            Operation::Auth => self.handle_auth(session, &request.params),
            Operation::Deauth => {
                session.clear_user();
                Ok(json!({}))
            }
            Operation::Ping => Ok(json!({"pong": true})),
            Operation::Get => self.handle_get(&request.params),
            Operation::Put => self.handle_put(&request.params),
            Operation::Del => self.handle_del(&request.params),
            Operation::Batch => self.handle_batch(&request.params),
            Operation::Range => self.handle_range(&request.params),
        }
    }

    fn params<T: DeserializeOwned>(params: &Value) -> Result<T, ServerError> {
        serde_json::from_value(params.clone()).map_err(|e| ServerError::InvalidRequest(e.to_string()))
    }

    fn handle_hello(
        &self,
        session: &mut ConnectionSession,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let hello: HelloParams = Self::params(params)?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::UnsupportedProtocol(hello.protocol_version));
        }
        session.complete_handshake(hello.protocol_version, hello.client_name);

        let result = HelloResult {
            protocol_version: PROTOCOL_VERSION,
            server_name: self.info.name.clone(),
            server_version: self.info.version.clone(),
            manifest: self.manifest.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn handle_auth(
        &self,
        session: &mut ConnectionSession,
        params: &Value,
    ) -> Result<Value, ServerError> {
        let auth: AuthParams = Self::params(params)?;
        let authenticator = self.hooks.authenticator.as_ref().ok_or_else(|| {
            ServerError::AuthFailed("authentication is not configured".to_string())
        })?;

        let user = authenticator
            .authenticate(&auth.credentials)
            .map_err(ServerError::AuthFailed)?;
        tracing::info!("[{}] authenticated as {}", session.remote_addr, user);
        session.set_user(user.clone());
        Ok(serde_json::to_value(AuthResult { user })?)
    }

    fn handle_get(&self, params: &Value) -> Result<Value, ServerError> {
        let KeyParams { key } = Self::params(params)?;
        match self.store.get(&key)? {
            Some(value) => Ok(serde_json::to_value(GetResult { value })?),
            None => Err(ServerError::NotFound(key)),
        }
    }

    fn handle_put(&self, params: &Value) -> Result<Value, ServerError> {
        let PutParams { key, value } = Self::params(params)?;
        self.store.put(&key, &value)?;
        Ok(json!({}))
    }

    fn handle_del(&self, params: &Value) -> Result<Value, ServerError> {
        let KeyParams { key } = Self::params(params)?;
        self.store.del(&key)?;
        Ok(json!({}))
    }

    fn handle_batch(&self, params: &Value) -> Result<Value, ServerError> {
        let BatchParams { ops } = Self::params(params)?;
        let ops: Vec<WriteOp> = ops
            .into_iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => WriteOp::Put { key, value },
                BatchOp::Del { key } => WriteOp::Del { key },
            })
            .collect();
        let applied = ops.len();
        self.store.batch(ops)?;
        Ok(json!({ "applied": applied }))
    }

    fn handle_range(&self, params: &Value) -> Result<Value, ServerError> {
        let range: RangeParams = Self::params(params)?;
        let options = RangeOptions {
            gte: range.gte,
            lte: range.lte,
            limit: range.limit,
            reverse: range.reverse,
        };
        let entries = self
            .store
            .range(&options)?
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect();
        Ok(serde_json::to_value(RangeResult { entries })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{PasswordAuthenticator, WriterPolicy};
    use kvlink_protocol::ErrorCode;
    use kvlink_store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_stub(hooks: Hooks) -> (ServerStub, ConnectionSession) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let stub = ServerStub::new(store, Manifest::full(), hooks);
        let session = ConnectionSession::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));
        (stub, session)
    }

    fn example_hooks() -> Hooks {
        Hooks {
            authenticator: Some(Arc::new(
                PasswordAuthenticator::default().with_user("root", "p@ss"),
            )),
            access: Some(Arc::new(WriterPolicy::new(["root".to_string()]))),
        }
    }

    fn call(
        stub: &ServerStub,
        session: &mut ConnectionSession,
        op: Operation,
        params: Value,
    ) -> Response {
        stub.handle(session, &Request::new(1, op).with_params(params))
    }

    fn error_code(response: Response) -> ErrorCode {
        response.into_result().unwrap_err().code
    }

    #[test]
    fn test_hello_returns_manifest() {
        let (stub, mut session) = test_stub(Hooks::default());
        let response = call(
            &stub,
            &mut session,
            Operation::Hello,
            json!({"protocol_version": 1, "client_name": "test"}),
        );

        assert!(response.meta.server_time.is_some());
        let result: HelloResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(result.server_name, "kvlink");
        assert_eq!(result.manifest, Manifest::full());
        assert_eq!(session.client_name(), Some("test"));
    }

    #[test]
    fn test_hello_wrong_version() {
        let (stub, mut session) = test_stub(Hooks::default());
        let response = call(&stub, &mut session, Operation::Hello, json!({"protocol_version": 9}));
        assert_eq!(error_code(response), ErrorCode::UnsupportedProtocol);
    }

    #[test]
    fn test_put_get_del() {
        let (stub, mut session) = test_stub(Hooks::default());

        let response = call(&stub, &mut session, Operation::Put, json!({"key": "a", "value": "1"}));
        assert!(response.is_ok());

        let response = call(&stub, &mut session, Operation::Get, json!({"key": "a"}));
        assert_eq!(response.into_result().unwrap()["value"], "1");

        call(&stub, &mut session, Operation::Del, json!({"key": "a"}));
        let response = call(&stub, &mut session, Operation::Get, json!({"key": "a"}));
        assert_eq!(error_code(response), ErrorCode::NotFound);
        assert_eq!(session.request_count(), 4);
    }

    #[test]
    fn test_batch_and_range() {
        let (stub, mut session) = test_stub(Hooks::default());
        let response = call(
            &stub,
            &mut session,
            Operation::Batch,
            json!({"ops": [
                {"type": "put", "key": "b", "value": "2"},
                {"type": "put", "key": "a", "value": "1"},
                {"type": "put", "key": "c", "value": "3"},
                {"type": "del", "key": "b"}
            ]}),
        );
        assert_eq!(response.into_result().unwrap()["applied"], 4);

        let response = call(&stub, &mut session, Operation::Range, json!({"reverse": true}));
        let result: RangeResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        let keys: Vec<_> = result.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a"]);
    }

    #[test]
    fn test_bad_params() {
        let (stub, mut session) = test_stub(Hooks::default());
        let response = call(&stub, &mut session, Operation::Put, json!({"key": "a"}));
        assert_eq!(error_code(response), ErrorCode::BadRequest);
    }

    #[test]
    fn test_auth_without_authenticator() {
        let (stub, mut session) = test_stub(Hooks::default());
        let response = call(
            &stub,
            &mut session,
            Operation::Auth,
            json!({"credentials": {"name": "root", "password": "p@ss"}}),
        );
        assert_eq!(error_code(response), ErrorCode::AuthFailed);
    }

    #[test]
    fn test_access_policy_gates_writes() {
        let (stub, mut session) = test_stub(example_hooks());

        // Anonymous reads are allowed, writes are not
        let response = call(&stub, &mut session, Operation::Put, json!({"key": "a", "value": "1"}));
        assert_eq!(error_code(response), ErrorCode::AccessDenied);
        let response = call(&stub, &mut session, Operation::Range, json!({}));
        assert!(response.is_ok());

        // Wrong password leaves the session anonymous
        let response = call(
            &stub,
            &mut session,
            Operation::Auth,
            json!({"credentials": {"name": "root", "password": "nope"}}),
        );
        assert_eq!(error_code(response), ErrorCode::AuthFailed);
        assert!(session.user().is_none());

        let response = call(
            &stub,
            &mut session,
            Operation::Auth,
            json!({"credentials": {"name": "root", "password": "p@ss"}}),
        );
        assert_eq!(response.into_result().unwrap()["user"]["name"], "root");

        let response = call(&stub, &mut session, Operation::Put, json!({"key": "a", "value": "1"}));
        assert!(response.is_ok());

        call(&stub, &mut session, Operation::Deauth, json!({}));
        let response = call(&stub, &mut session, Operation::Del, json!({"key": "a"}));
        assert_eq!(error_code(response), ErrorCode::AccessDenied);
    }

    #[test]
    fn test_manifest_restricts_methods() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let stub = ServerStub::new(store, Manifest::read_only(), Hooks::default());
        let mut session = ConnectionSession::new("127.0.0.1:1".parse().unwrap());

        let response = call(&stub, &mut session, Operation::Put, json!({"key": "a", "value": "1"}));
        assert_eq!(error_code(response), ErrorCode::MethodNotAllowed);
        assert!(call(&stub, &mut session, Operation::Ping, json!({})).is_ok());
    }

    #[test]
    fn test_closed_store() {
        let (stub, mut session) = test_stub(Hooks::default());
        stub.store().close().unwrap();

        let response = call(&stub, &mut session, Operation::Get, json!({"key": "a"}));
        let error = response.into_result().unwrap_err();
        assert_eq!(error.code, ErrorCode::StoreClosed);
        assert!(error.retryable);
    }
}
