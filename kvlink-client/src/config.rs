//! Client configuration.

use crate::backoff::BackoffConfig;
use kvlink_core::{options, ConfigError, OptionMap, DEFAULT_PORT};
use kvlink_protocol::Manifest;
use serde_json::Value;
use std::time::Duration;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Methods this client may call.
    pub manifest: Manifest,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Treat a connection that receives nothing for this long as dead.
    pub idle_timeout: Option<Duration>,
    /// Sent as AUTH after every successful handshake.
    pub credentials: Option<Value>,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            manifest: Manifest::full(),
            client_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: None,
            credentials: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Builds a configuration from a loose option map.
    ///
    /// `host` is required. `manifest` may be a manifest object or the path
    /// of a manifest file. Unknown keys are ignored.
    pub fn from_options(mut map: OptionMap) -> Result<Self, ConfigError> {
        let host = options::take_required_str(&mut map, "host")?;
        let mut config = Self::new(host);

        config.port = options::port(map.get("port"));
        match map.remove("manifest") {
            None | Some(Value::Null) => {}
            Some(Value::String(path)) => {
                config.manifest = Manifest::from_file(&path)
                    .map_err(|e| ConfigError::invalid("manifest", format!("{}: {}", path, e)))?;
            }
            Some(value) => {
                config.manifest = serde_json::from_value(value)
                    .map_err(|e| ConfigError::invalid("manifest", e.to_string()))?;
            }
        }
        config.client_name = map
            .get("client_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(timeout) = options::seconds(map.get("connect_timeout_secs")) {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = options::seconds(map.get("request_timeout_secs")) {
            config.request_timeout = timeout;
        }
        config.idle_timeout = options::seconds(map.get("idle_timeout_secs"));
        config.credentials = map.remove("credentials").filter(|v| !v.is_null());
        if let Some(backoff) = map.remove("backoff") {
            config.backoff = serde_json::from_value(backoff)
                .map_err(|e| ConfigError::invalid("backoff", e.to_string()))?;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: Value) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// `host:port`, for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
