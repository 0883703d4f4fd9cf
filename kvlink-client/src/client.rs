//! High-level client API.

use crate::backoff::{AttemptCounter, BackoffTimer};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::Driver;
use crate::stub::ClientStub;
use kvlink_core::{EventEnvelope, EventRouter, OptionMap, SessionState};
use kvlink_protocol::message::*;
use kvlink_protocol::ErrorCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// A self-healing session with one kvlink server.
///
/// Connecting starts as soon as the client is created. When the connection
/// drops the session moves to [`SessionState::Stopped`] and retries on the
/// backoff schedule until a connection succeeds again. Dropping the client
/// ends the session.
pub struct Client {
    config: Arc<ClientConfig>,
    events: EventRouter,
    state: watch::Receiver<SessionState>,
    db: Db,
    attempts: AttemptCounter,
    driver: JoinHandle<()>,
}

impl Client {
    /// Creates a client and starts connecting. Requires a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_events(config, EventRouter::default())
    }

    /// Like [`Client::new`], publishing events through `events`.
    pub fn with_events(config: ClientConfig, events: EventRouter) -> Result<Self, ClientError> {
        let handle = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let config = Arc::new(config);

        let (state_tx, state_rx) = watch::channel(SessionState::Init);
        let (stub_tx, stub_rx) = watch::channel(None);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let timer = BackoffTimer::new(config.backoff.clone(), timer_tx);
        let attempts = timer.counter();
        let driver = Driver::new(
            config.clone(),
            events.clone(),
            state_tx,
            stub_tx,
            timer,
            link_tx,
        );
        let driver = handle.spawn(driver.run(link_rx, timer_rx));

        Ok(Self {
            config,
            events,
            state: state_rx,
            db: Db { stub: stub_rx },
            attempts,
            driver,
        })
    }

    /// Creates a client from a loose option map. `host` is required.
    pub fn from_options(map: OptionMap) -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_options(map)?)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Waits until the session reaches `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventRouter {
        &self.events
    }

    /// Store handle. Calls fail with [`ClientError::NotConnected`] while the
    /// session has no open stream.
    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Retry attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.get()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Store operations over the session's current stream.
///
/// Cheap to clone. A call uses whichever stream is open when it starts; it
/// is not replayed after a reconnect.
#[derive(Clone)]
pub struct Db {
    stub: watch::Receiver<Option<Arc<ClientStub>>>,
}

impl Db {
    fn current(&self) -> Result<Arc<ClientStub>, ClientError> {
        self.stub
            .borrow()
            .as_ref()
            .cloned()
            .ok_or(ClientError::NotConnected)
    }

    async fn request(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        self.current()?.call(op, params).await
    }

    /// Whether a stream is open right now.
    pub fn is_connected(&self) -> bool {
        self.stub.borrow().as_ref().is_some_and(|stub| stub.is_open())
    }

    /// The HELLO result of the current stream.
    pub fn server(&self) -> Option<HelloResult> {
        self.stub.borrow().as_ref().map(|stub| stub.server().clone())
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Operation::Ping, json!({})).await?;
        Ok(())
    }

    /// Authenticates the current stream. Returns the user value the server
    /// attached to it.
    pub async fn auth(&self, credentials: Value) -> Result<Value, ClientError> {
        let result = self
            .request(Operation::Auth, json!({ "credentials": credentials }))
            .await?;
        let result: AuthResult = serde_json::from_value(result)?;
        Ok(result.user)
    }

    pub async fn deauth(&self) -> Result<(), ClientError> {
        self.request(Operation::Deauth, json!({})).await?;
        Ok(())
    }

    /// Returns `None` if the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        match self.request(Operation::Get, json!({ "key": key })).await {
            Ok(result) => {
                let result: GetResult = serde_json::from_value(result)?;
                Ok(Some(result.value))
            }
            Err(ClientError::ServerError {
                code: ErrorCode::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.request(Operation::Put, json!({ "key": key, "value": value }))
            .await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), ClientError> {
        self.request(Operation::Del, json!({ "key": key })).await?;
        Ok(())
    }

    /// Applies all operations atomically. Returns how many were applied.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<usize, ClientError> {
        let params = serde_json::to_value(BatchParams { ops })?;
        let result = self.request(Operation::Batch, params).await?;
        Ok(result["applied"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn range(&self, params: RangeParams) -> Result<Vec<Entry>, ClientError> {
        let result = self
            .request(Operation::Range, serde_json::to_value(params)?)
            .await?;
        let result: RangeResult = serde_json::from_value(result)?;
        Ok(result.entries)
    }
}
