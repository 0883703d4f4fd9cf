//! Server session: the listener lifecycle and per-connection tasks.

use crate::error::ServerError;
use crate::hooks::{AccessPolicy, Authenticator, Hooks, PasswordAuthenticator, WriterPolicy};
use crate::session::ConnectionSession;
use crate::stub::ServerStub;
use dashmap::DashMap;
use kvlink_core::{
    options, ConfigError, ErrorKind, EventEnvelope, EventRouter, OptionMap, OriginTag,
    SessionEvent, SessionState, DEFAULT_PORT,
};
use kvlink_protocol::{Decoder, Encoder, Manifest, Notice, NoticeEvent};
use kvlink_store::{Store, StoreFactory, StoreOptions};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Bind host used when none is configured.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Pause after a failed accept before accepting again.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

const LISTEN_BACKLOG: u32 = 1024;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Store location handed to the factory.
    pub location: String,
    pub host: String,
    pub port: u16,
    /// Start as part of construction.
    pub autostart: bool,
    /// Close connections that send nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: Option<usize>,
    /// Options forwarded verbatim to the storage engine.
    pub store_options: StoreOptions,
    /// Methods connected clients may call.
    pub manifest: Manifest,
    pub hooks: Hooks,
}

/// `auth` section of the server options.
#[derive(Debug, Default, Deserialize)]
struct AuthOptions {
    /// user name -> SHA-256 password hash
    #[serde(default)]
    users: BTreeMap<String, String>,
}

/// `access` section of the server options.
#[derive(Debug, Default, Deserialize)]
struct AccessOptions {
    #[serde(default)]
    writers: Vec<String>,
}

impl ServerConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            autostart: false,
            idle_timeout: None,
            max_connections: None,
            store_options: StoreOptions::new(),
            manifest: Manifest::full(),
            hooks: Hooks::default(),
        }
    }

    /// Builds a configuration from a loose option map.
    ///
    /// `location` is required. `port`, `autostart`, `host`,
    /// `idle_timeout_secs`, `max_connections`, `auth` and `access` are
    /// consumed here; every other key becomes a store option.
    pub fn from_options(mut map: OptionMap) -> Result<Self, ConfigError> {
        let location = options::take_required_str(&mut map, "location")?;
        let mut config = Self::new(location);

        config.port = options::port(map.remove("port").as_ref());
        config.autostart = options::flag(map.remove("autostart").as_ref(), false);
        if let Some(host) = map.remove("host") {
            match host.as_str() {
                Some(h) if !h.is_empty() => config.host = h.to_string(),
                Some(_) => {}
                None => return Err(ConfigError::invalid("host", "expected a string")),
            }
        }
        config.idle_timeout = options::seconds(map.remove("idle_timeout_secs").as_ref());
        config.max_connections = options::unsigned(map.remove("max_connections").as_ref())
            .map(|n| n as usize);

        if let Some(auth) = map.remove("auth") {
            let auth: AuthOptions = serde_json::from_value(auth)
                .map_err(|e| ConfigError::invalid("auth", e.to_string()))?;
            if !auth.users.is_empty() {
                config.hooks.authenticator = Some(Arc::new(PasswordAuthenticator::new(auth.users)));
            }
        }
        if let Some(access) = map.remove("access") {
            let access: AccessOptions = serde_json::from_value(access)
                .map_err(|e| ConfigError::invalid("access", e.to_string()))?;
            config.hooks.access = Some(Arc::new(WriterPolicy::new(access.writers)));
        }

        config.store_options = StoreOptions::from_map(map);
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the listen port. Port 0 binds an ephemeral port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_store_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.store_options = self.store_options.with(key, value);
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.hooks.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn with_access_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.hooks.access = Some(Arc::new(policy));
        self
    }

    fn bind_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("location", &self.location)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("autostart", &self.autostart)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("store_options", &self.store_options)
            .field("manifest_methods", &self.manifest.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// State shared by the accept loop and every connection task.
struct ConnectionContext {
    stub: ServerStub,
    events: EventRouter,
    connections: Arc<DashMap<String, SocketAddr>>,
    idle_timeout: Option<Duration>,
    max_connections: Option<usize>,
    shutdown: broadcast::Sender<()>,
}

/// Resources held while the server is running.
struct Running {
    store: Arc<dyn Store>,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    store_watch: JoinHandle<()>,
    /// Set by whoever reports the store closure first.
    store_close_reported: Arc<AtomicBool>,
}

/// A key-value store served over TCP.
///
/// The server is reactive: it accepts connections, serves them, and tears
/// them down when they fail. It never retries anything itself. `start`
/// and `stop` are idempotent and must be called from within a Tokio
/// runtime.
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn StoreFactory>,
    events: EventRouter,
    state: watch::Sender<SessionState>,
    running: Mutex<Option<Running>>,
    connections: Arc<DashMap<String, SocketAddr>>,
}

impl Server {
    /// Creates a server, starting it right away if `autostart` is set.
    pub fn new(
        config: ServerConfig,
        factory: impl StoreFactory + 'static,
    ) -> Result<Self, ServerError> {
        let (state, _) = watch::channel(SessionState::Init);
        let server = Self {
            config,
            factory: Arc::new(factory),
            events: EventRouter::default(),
            state,
            running: Mutex::new(None),
            connections: Arc::new(DashMap::new()),
        };
        if server.config.autostart {
            server.start()?;
        }
        Ok(server)
    }

    /// Creates a server from a loose option map.
    pub fn from_options(
        options: OptionMap,
        factory: impl StoreFactory + 'static,
    ) -> Result<Self, ServerError> {
        Self::new(ServerConfig::from_options(options)?, factory)
    }

    /// Opens the store, then the listener. No-op while running.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;

        let store = match self
            .factory
            .open(&self.config.location, &self.config.store_options)
        {
            Ok(store) => store,
            Err(e) => {
                self.events.error(OriginTag::Database, ErrorKind::Store, &e);
                return Err(e.into());
            }
        };

        let (listener, local_addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                self.events.error(OriginTag::TcpServer, ErrorKind::Transport, &e);
                if let Err(close_err) = store.close() {
                    tracing::warn!("Failed to close store after bind failure: {}", close_err);
                }
                return Err(e.into());
            }
        };
        tracing::info!(
            "Server listening on {} (store: {})",
            local_addr,
            self.config.location
        );

        let (shutdown, _) = broadcast::channel(1);
        let ctx = Arc::new(ConnectionContext {
            stub: ServerStub::new(
                store.clone(),
                self.config.manifest.clone(),
                self.config.hooks.clone(),
            ),
            events: self.events.clone(),
            connections: self.connections.clone(),
            idle_timeout: self.config.idle_timeout,
            max_connections: self.config.max_connections,
            shutdown: shutdown.clone(),
        });
        let accept_task = runtime.spawn(Self::accept_loop(listener, ctx, shutdown.subscribe()));

        let store_close_reported = Arc::new(AtomicBool::new(false));
        let store_watch = runtime.spawn({
            let closed = store.closed();
            let events = self.events.clone();
            let reported = store_close_reported.clone();
            async move {
                wait_closed(closed).await;
                if !reported.swap(true, Ordering::SeqCst) {
                    tracing::info!("Store closed");
                    events.close(OriginTag::Database);
                }
            }
        });

        *running = Some(Running {
            store,
            local_addr,
            shutdown,
            accept_task,
            store_watch,
            store_close_reported,
        });
        self.state.send_replace(SessionState::Running);
        Ok(())
    }

    /// Closes the listener and the store. No-op unless running. The port
    /// is free again once this returns.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(mut running) = self.halt() else {
            return Ok(());
        };
        // The accept task owns the listener.
        let _ = (&mut running.accept_task).await;
        self.release(running)
    }

    /// Takes the running resources and tells every task to wind down.
    fn halt(&self) -> Option<Running> {
        let running = self.running.lock().take()?;
        self.state.send_replace(SessionState::Stopped);
        self.events.route(OriginTag::LevelServer, SessionEvent::Stop);

        // Connections send their store_closed notice on this signal.
        let _ = running.shutdown.send(());
        running.accept_task.abort();
        Some(running)
    }

    fn release(&self, running: Running) -> Result<(), ServerError> {
        tracing::info!("Listener on {} closed", running.local_addr);
        self.events.close(OriginTag::TcpServer);

        running.store_watch.abort();
        let result = running.store.close();
        if let Err(e) = &result {
            self.events.error(OriginTag::Database, ErrorKind::Store, e);
        }
        if !running.store_close_reported.swap(true, Ordering::SeqCst) {
            self.events.close(OriginTag::Database);
        }
        result.map_err(ServerError::from)
    }

    fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let addr = self.config.bind_addr()?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<ConnectionContext>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Some(max) = ctx.max_connections {
                                if ctx.connections.len() >= max {
                                    tracing::warn!("Connection limit reached, rejecting {}", addr);
                                    continue;
                                }
                            }
                            let conn_shutdown = ctx.shutdown.subscribe();
                            tokio::spawn(Self::handle_connection(stream, addr, ctx.clone(), conn_shutdown));
                        }
                        Err(e) => {
                            ctx.events.error(OriginTag::TcpServer, ErrorKind::Transport, &e);
                            tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Accept loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<ConnectionContext>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut session = ConnectionSession::new(addr);
        ctx.connections.insert(session.id.clone(), addr);
        tracing::info!("Client connected: {} ({})", addr, session.id);
        ctx.events.connect(OriginTag::TcpClient);

        let result = Self::serve(&mut stream, &mut session, &ctx, &mut shutdown).await;
        match result {
            Ok(()) => {}
            Err(ServerError::Protocol(e)) => {
                ctx.events.error(OriginTag::RpcStream, ErrorKind::Protocol, e)
            }
            Err(e) => ctx.events.error(OriginTag::TcpClient, ErrorKind::Transport, e),
        }

        let _ = stream.shutdown().await;
        ctx.connections.remove(&session.id);
        tracing::info!(
            "Client disconnected: {} after {} requests",
            addr,
            session.request_count()
        );
        ctx.events.close(OriginTag::TcpClient);
    }

    /// Runs one connection until the peer leaves, it idles out, the
    /// server stops or the store closes.
    async fn serve(
        stream: &mut TcpStream,
        session: &mut ConnectionSession,
        ctx: &ConnectionContext,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];
        let store_closed = wait_closed(ctx.stub.store().closed());
        tokio::pin!(store_closed);

        loop {
            let idle = async {
                match ctx.idle_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = stream.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        tracing::debug!("[{}] Connection closed by client", addr);
                        return Ok(());
                    }
                    tracing::debug!("[{}] Received {} bytes", addr, n);
                    decoder.extend(&buf[..n]);
                }
                _ = idle => {
                    tracing::debug!("[{}] Idle timeout", addr);
                    return Ok(());
                }
                _ = shutdown.recv() => {
                    Self::send_store_closed(stream, "server stopped").await;
                    return Ok(());
                }
                _ = &mut store_closed => {
                    Self::send_store_closed(stream, "store closed").await;
                    return Ok(());
                }
            }

            while let Some(request) = decoder.decode_request()? {
                tracing::debug!("[{}] Request: {} (id={})", addr, request.op, request.id);
                let response = ctx.stub.handle(session, &request);
                tracing::debug!(
                    "[{}] Response: {} (id={})",
                    addr,
                    if response.is_ok() { "OK" } else { "ERROR" },
                    response.id
                );
                let bytes = Encoder::encode_response(&response)?;
                stream.write_all(&bytes).await?;
            }
        }
    }

    async fn send_store_closed(stream: &mut TcpStream, reason: &str) {
        let notice = Notice::new(NoticeEvent::StoreClosed).with_reason(reason);
        match Encoder::encode_notice(&notice) {
            Ok(bytes) => {
                if let Err(e) = stream.write_all(&bytes).await {
                    tracing::debug!("Failed to send store_closed notice: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode store_closed notice: {}", e),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Receiver tracking state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// The open store, while running.
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.running.lock().as_ref().map(|r| r.store.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventRouter {
        &self.events
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    /// Stops without waiting; the listener goes when the runtime drops the
    /// aborted accept task.
    fn drop(&mut self) {
        if let Some(running) = self.halt() {
            if let Err(e) = self.release(running) {
                tracing::warn!("Error stopping server on drop: {}", e);
            }
        }
    }
}

/// Resolves once the store's closed flag is set or its sender is gone.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlink_protocol::message::{PutParams, RangeResult};
    use kvlink_protocol::{Message, Operation, Request, Response};
    use kvlink_store::{LogStoreFactory, MemoryStoreFactory};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn options(value: Value) -> OptionMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new("mem").with_host("127.0.0.1").with_port(0)
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<EventEnvelope>,
    ) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn roundtrip(stream: &mut TcpStream, decoder: &mut Decoder, request: Request) -> Message {
        stream
            .write_all(&Encoder::encode_request(&request).unwrap())
            .await
            .unwrap();
        read_message(stream, decoder).await
    }

    async fn read_message(stream: &mut TcpStream, decoder: &mut Decoder) -> Message {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(message) = decoder.decode_message().unwrap() {
                return message;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed");
            decoder.extend(&buf[..n]);
        }
    }

    fn into_response(message: Message) -> Response {
        match message {
            Message::Response(response) => response,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::from_options(options(json!({"location": "/tmp/db"}))).unwrap();
        assert_eq!(config.location, "/tmp/db");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.autostart);
        assert_eq!(config.host, DEFAULT_HOST);
        assert!(config.store_options.is_empty());
        assert!(config.hooks.authenticator.is_none());
    }

    #[test]
    fn test_config_requires_location() {
        assert!(matches!(
            ServerConfig::from_options(options(json!({"port": 9091}))),
            Err(ConfigError::MissingOption("location"))
        ));
    }

    #[test]
    fn test_config_forwards_store_options() {
        let config = ServerConfig::from_options(options(json!({
            "location": "/tmp/db",
            "port": "9091",
            "autostart": true,
            "idle_timeout_secs": 30,
            "max_connections": 10,
            "auth": {"users": {"root": PasswordAuthenticator::hash_password("p@ss")}},
            "access": {"writers": ["root"]},
            "sync": true,
            "valueEncoding": "json"
        })))
        .unwrap();

        assert_eq!(config.port, 9091);
        assert!(config.autostart);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_connections, Some(10));
        assert!(config.hooks.authenticator.is_some());
        assert!(config.hooks.access.is_some());
        assert_eq!(config.store_options.len(), 2);
        assert!(config.store_options.sync());
        assert_eq!(config.store_options.get("valueEncoding"), Some(&json!("json")));
    }

    #[test]
    fn test_config_non_numeric_port() {
        let config =
            ServerConfig::from_options(options(json!({"location": "x", "port": "abc"}))).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_start_without_runtime() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        assert!(matches!(server.start(), Err(ServerError::NoRuntime)));
        assert_eq!(server.state(), SessionState::Init);
    }

    #[tokio::test]
    async fn test_autostart_and_stop() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::new(dir.path().to_string_lossy())
            .with_host("127.0.0.1")
            .with_port(0)
            .with_autostart(true);
        let server = Server::new(config, LogStoreFactory).unwrap();
        assert_eq!(server.state(), SessionState::Running);
        assert!(server.local_addr().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await.unwrap();
        assert_eq!(server.state(), SessionState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        assert_eq!(server.state(), SessionState::Init);

        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        let store = server.store().unwrap();
        server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(Arc::ptr_eq(&store, &server.store().unwrap()));
    }

    #[tokio::test]
    async fn test_stop_tears_down_once() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        let mut events = server.subscribe();

        // Stopping a server that never started changes nothing
        server.stop().await.unwrap();
        assert_eq!(server.state(), SessionState::Init);

        server.start().unwrap();
        let store = server.store().unwrap();
        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(store.is_closed());

        assert!(next_event(&mut events).await.is(OriginTag::LevelServer, &SessionEvent::Stop));
        assert!(next_event(&mut events).await.is(OriginTag::TcpServer, &SessionEvent::Close));
        assert!(next_event(&mut events).await.is(OriginTag::Database, &SessionEvent::Close));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let factory = MemoryStoreFactory::new();
        let server = Server::new(local_config(), factory).unwrap();
        server.start().unwrap();
        server.store().unwrap().put("k", "v").unwrap();
        server.stop().await.unwrap();

        server.start().unwrap();
        assert_eq!(server.state(), SessionState::Running);
        assert_eq!(server.store().unwrap().get("k").unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_restart_on_same_port() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ServerConfig::new("mem").with_host("127.0.0.1").with_port(port);
        let server = Server::new(config, MemoryStoreFactory::new()).unwrap();

        for _ in 0..3 {
            server.start().unwrap();
            assert_eq!(server.local_addr().unwrap().port(), port);
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            server.stop().await.unwrap();
            assert_eq!(server.state(), SessionState::Stopped);
            drop(stream);
        }
    }

    #[tokio::test]
    async fn test_serves_requests() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        let mut events = server.subscribe();
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let mut decoder = Decoder::new();
        assert!(next_event(&mut events).await.is(OriginTag::TcpClient, &SessionEvent::Connect));

        let put = Request::new(1, Operation::Put).with_params(
            serde_json::to_value(PutParams {
                key: "a".into(),
                value: "1".into(),
            })
            .unwrap(),
        );
        let response = into_response(roundtrip(&mut stream, &mut decoder, put).await);
        assert!(response.is_ok());
        assert_eq!(response.id, 1);

        let range = Request::new(2, Operation::Range);
        let response = into_response(roundtrip(&mut stream, &mut decoder, range).await);
        let result: RangeResult = serde_json::from_value(response.into_result().unwrap()).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(server.connection_count(), 1);

        drop(stream);
        assert!(next_event(&mut events).await.is(OriginTag::TcpClient, &SessionEvent::Close));
    }

    #[tokio::test]
    async fn test_bad_frame_closes_connection() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        let mut events = server.subscribe();
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        next_event(&mut events).await;
        stream.write_all(b"GARBAGE-GARBAGE-GARBAGE").await.unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.source, OriginTag::RpcStream);
        assert_eq!(event.error_kind(), Some(ErrorKind::Protocol));
        assert!(next_event(&mut events).await.is(OriginTag::TcpClient, &SessionEvent::Close));
        assert_eq!(server.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_stop_notifies_connections() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let mut decoder = Decoder::new();
        let ping = Request::new(1, Operation::Ping);
        assert!(into_response(roundtrip(&mut stream, &mut decoder, ping).await).is_ok());

        server.stop().await.unwrap();
        match read_message(&mut stream, &mut decoder).await {
            Message::Notice(notice) => assert_eq!(notice.event, NoticeEvent::StoreClosed),
            other => panic!("expected notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_closed_externally() {
        let server = Server::new(local_config(), MemoryStoreFactory::new()).unwrap();
        let mut events = server.subscribe();
        server.start().unwrap();

        server.store().unwrap().close().unwrap();
        assert!(next_event(&mut events).await.is(OriginTag::Database, &SessionEvent::Close));
        assert_eq!(server.state(), SessionState::Running);

        // The closure was already reported; stop does not report it again
        server.stop().await.unwrap();
        assert!(next_event(&mut events).await.is(OriginTag::LevelServer, &SessionEvent::Stop));
        assert!(next_event(&mut events).await.is(OriginTag::TcpServer, &SessionEvent::Close));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_open_failure() {
        let factory = |_: &str, _: &StoreOptions| -> Result<Arc<dyn Store>, kvlink_store::StoreError> {
            Err(kvlink_store::StoreError::NotFound("missing".into()))
        };
        let server = Server::new(local_config(), factory).unwrap();
        let mut events = server.subscribe();

        assert!(matches!(server.start(), Err(ServerError::Store(_))));
        assert_eq!(server.state(), SessionState::Init);
        let event = next_event(&mut events).await;
        assert_eq!(event.source, OriginTag::Database);
        assert_eq!(event.error_kind(), Some(ErrorKind::Store));
    }

    #[tokio::test]
    async fn test_max_connections() {
        let server = Server::new(
            local_config().with_max_connections(1),
            MemoryStoreFactory::new(),
        )
        .unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut decoder = Decoder::new();
        let ping = Request::new(1, Operation::Ping);
        assert!(into_response(roundtrip(&mut first, &mut decoder, ping).await).is_ok());

        // The second connection is accepted and dropped straight away
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let server = Server::new(
            local_config().with_idle_timeout(Duration::from_millis(100)),
            MemoryStoreFactory::new(),
        )
        .unwrap();
        let mut events = server.subscribe();
        server.start().unwrap();

        let _stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert!(next_event(&mut events).await.is(OriginTag::TcpClient, &SessionEvent::Connect));
        assert!(next_event(&mut events).await.is(OriginTag::TcpClient, &SessionEvent::Close));
    }
}
