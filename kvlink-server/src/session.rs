//! Per-connection session state.

use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State of one accepted connection.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Unique connection ID.
    pub id: String,

    pub remote_addr: SocketAddr,

    /// Negotiated protocol version (0 until HELLO).
    protocol_version: u16,

    /// Client name from HELLO.
    client_name: Option<String>,

    /// User attached by a successful AUTH.
    user: Option<Value>,

    request_count: u64,

    created_at: Instant,

    last_activity: Instant,
}

impl ConnectionSession {
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            protocol_version: 0,
            client_name: None,
            user: None,
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn complete_handshake(&mut self, protocol_version: u16, client_name: Option<String>) {
        self.protocol_version = protocol_version;
        self.client_name = client_name;
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, user: Value) {
        self.user = Some(user);
    }

    /// Drops the authenticated user. Returns whether one was attached.
    pub fn clear_user(&mut self) -> bool {
        self.user.take().is_some()
    }

    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Time since the last request.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
