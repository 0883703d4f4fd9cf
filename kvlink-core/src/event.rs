//! Session events and the router that tags and publishes them.

use crate::origin::{ErrorKind, OriginTag};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default capacity of a session's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A signal raised by a session or one of its sub-resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A failure. Errors never change session state on their own.
    Error { kind: ErrorKind, message: String },
    /// A transport connected or an RPC stream opened.
    Connect,
    /// A transport, listener or store closed.
    Close,
    /// The client is about to make retry attempt `attempts`; the timer
    /// fires again after `delay`.
    Reconnecting { attempts: u32, delay: Duration },
    /// The server session was stopped.
    Stop,
    /// The backoff timer ran out of attempts and will not fire again.
    Exhausted,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Error { .. } => "error",
            SessionEvent::Connect => "connect",
            SessionEvent::Close => "close",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::Stop => "stop",
            SessionEvent::Exhausted => "exhausted",
        }
    }
}

/// An event together with the origin it was raised from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub source: OriginTag,
    pub event: SessionEvent,
}

impl EventEnvelope {
    pub fn new(source: OriginTag, event: SessionEvent) -> Self {
        Self { source, event }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.event, SessionEvent::Error { .. })
    }

    /// Kind of the carried error, if this is an error envelope.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.event {
            SessionEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this is `event` raised from `source`.
    pub fn is(&self, source: OriginTag, event: &SessionEvent) -> bool {
        self.source == source && &self.event == event
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event {
            SessionEvent::Error { kind, message } => {
                write!(f, "[{}] error ({}): {}", self.source, kind, message)
            }
            SessionEvent::Reconnecting { attempts, delay } => write!(
                f,
                "[{}] reconnecting attempts={} delay={}ms",
                self.source,
                attempts,
                delay.as_millis()
            ),
            other => write!(f, "[{}] {}", self.source, other.name()),
        }
    }
}

/// Tags signals with their origin and publishes them to subscribers.
///
/// Cloning yields another handle onto the same channel. Publishing never
/// blocks; with no subscribers the envelope is dropped, and slow
/// subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventRouter {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventRouter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Wraps `event` in an envelope tagged with `source` and publishes it.
    pub fn route(&self, source: OriginTag, event: SessionEvent) -> EventEnvelope {
        let envelope = EventEnvelope::new(source, event);
        match &envelope.event {
            SessionEvent::Error {
                kind: ErrorKind::Access,
                message,
            } => tracing::warn!(origin = %source, "{}", message),
            SessionEvent::Error { kind, message } => {
                tracing::error!(origin = %source, kind = %kind, "{}", message)
            }
            SessionEvent::Reconnecting { attempts, delay } => tracing::info!(
                origin = %source,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            ),
            SessionEvent::Exhausted => tracing::warn!(origin = %source, "reconnect attempts exhausted"),
            other => tracing::debug!(origin = %source, "{}", other.name()),
        }
        // An error here only means nobody is listening.
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    pub fn error(&self, source: OriginTag, kind: ErrorKind, message: impl fmt::Display) {
        self.route(
            source,
            SessionEvent::Error {
                kind,
                message: message.to_string(),
            },
        );
    }

    pub fn connect(&self, source: OriginTag) {
        self.route(source, SessionEvent::Connect);
    }

    pub fn close(&self, source: OriginTag) {
        self.route(source, SessionEvent::Close);
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_without_subscribers() {
        let router = EventRouter::default();
        let envelope = router.route(OriginTag::TcpServer, SessionEvent::Close);
        assert_eq!(envelope.source, OriginTag::TcpServer);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_tagged_events_in_order() {
        let router = EventRouter::new(16);
        let mut rx = router.subscribe();

        router.connect(OriginTag::TcpClient);
        router.error(OriginTag::RpcStream, ErrorKind::Protocol, "bad frame");
        router.route(
            OriginTag::LevelServer,
            SessionEvent::Reconnecting {
                attempts: 1,
                delay: Duration::from_secs(1),
            },
        );

        let first = rx.recv().await.unwrap();
        assert!(first.is(OriginTag::TcpClient, &SessionEvent::Connect));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.source, OriginTag::RpcStream);
        assert_eq!(second.error_kind(), Some(ErrorKind::Protocol));

        let third = rx.recv().await.unwrap();
        assert_eq!(
            third.event,
            SessionEvent::Reconnecting {
                attempts: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[tokio::test]
    async fn test_clones_share_channel() {
        let router = EventRouter::default();
        let mut rx = router.subscribe();
        let clone = router.clone();

        clone.close(OriginTag::Database);
        assert!(rx
            .recv()
            .await
            .unwrap()
            .is(OriginTag::Database, &SessionEvent::Close));
        assert_eq!(router.subscriber_count(), 1);
    }

    #[test]
    fn test_display() {
        let envelope = EventEnvelope::new(
            OriginTag::LevelServer,
            SessionEvent::Reconnecting {
                attempts: 3,
                delay: Duration::from_millis(3000),
            },
        );
        assert_eq!(
            envelope.to_string(),
            "[level_server] reconnecting attempts=3 delay=3000ms"
        );

        let envelope = EventEnvelope::new(
            OriginTag::TcpClient,
            SessionEvent::Error {
                kind: ErrorKind::Transport,
                message: "connection refused".into(),
            },
        );
        assert_eq!(
            envelope.to_string(),
            "[tcp_client] error (transport): connection refused"
        );
    }
}
