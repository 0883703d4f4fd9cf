//! Client session state machine.
//!
//! All transitions happen in one driver task. Connection attempts run in
//! their own task and report back over a channel, tagged with the
//! generation of the attempt; the backoff timer reports over another.
//! Signals from an attempt that has since been replaced are dropped.
//!
//! ```text
//! INIT --connect--> RUNNING --disconnect--> STOPPED --tick--> (new attempt)
//!   \                                          ^
//!    `------------connect failed---------------'
//! ```

use crate::backoff::{BackoffTimer, TimerSignal};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::stub::{connect_transport, ClientStub, DisconnectReason};
use kvlink_core::{ErrorKind, EventRouter, OriginTag, SessionEvent, SessionState};
use kvlink_protocol::Operation;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a connection attempt reports to the driver.
#[derive(Debug)]
pub(crate) enum LinkSignal {
    /// TCP connected.
    Connected { generation: u64 },
    /// Handshake complete; the stub is ready for calls.
    Opened {
        generation: u64,
        stub: Arc<ClientStub>,
    },
    /// A failure that does not end the attempt by itself.
    Error {
        generation: u64,
        source: OriginTag,
        kind: ErrorKind,
        message: String,
    },
    /// The attempt is over.
    Disconnected {
        generation: u64,
        reason: DisconnectReason,
    },
}

impl LinkSignal {
    fn generation(&self) -> u64 {
        match self {
            LinkSignal::Connected { generation }
            | LinkSignal::Opened { generation, .. }
            | LinkSignal::Error { generation, .. }
            | LinkSignal::Disconnected { generation, .. } => *generation,
        }
    }
}

/// Owns the session's state, timer and current attempt.
pub(crate) struct Driver {
    config: Arc<ClientConfig>,
    events: EventRouter,
    state: watch::Sender<SessionState>,
    stub: watch::Sender<Option<Arc<ClientStub>>>,
    timer: BackoffTimer,
    link: mpsc::UnboundedSender<LinkSignal>,
    generation: u64,
    attempt: Option<JoinHandle<()>>,
    /// The current attempt connected but has not finished its handshake.
    handshaking: bool,
}

impl Driver {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        events: EventRouter,
        state: watch::Sender<SessionState>,
        stub: watch::Sender<Option<Arc<ClientStub>>>,
        timer: BackoffTimer,
        link: mpsc::UnboundedSender<LinkSignal>,
    ) -> Self {
        Self {
            config,
            events,
            state,
            stub,
            timer,
            link,
            generation: 0,
            attempt: None,
            handshaking: false,
        }
    }

    /// Makes the initial attempt, then processes signals until dropped.
    pub(crate) async fn run(
        mut self,
        mut link_rx: mpsc::UnboundedReceiver<LinkSignal>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerSignal>,
    ) {
        self.start_attempt();
        loop {
            tokio::select! {
                Some(signal) = link_rx.recv() => self.on_link(signal),
                Some(signal) = timer_rx.recv() => self.on_timer(signal),
                else => break,
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn on_link(&mut self, signal: LinkSignal) {
        if signal.generation() != self.generation {
            tracing::trace!("Dropping signal from a replaced attempt: {:?}", signal);
            return;
        }

        match signal {
            LinkSignal::Connected { .. } => {
                tracing::info!("Connected to {}", self.config.address());
                self.timer.stop();
                self.handshaking = true;
                self.state.send_replace(SessionState::Running);
                self.events.connect(OriginTag::TcpClient);
            }
            LinkSignal::Opened { stub, .. } => {
                self.handshaking = false;
                self.stub.send_replace(Some(stub));
                self.events.connect(OriginTag::Database);
            }
            LinkSignal::Error {
                source,
                kind,
                message,
                ..
            } => self.events.error(source, kind, message),
            LinkSignal::Disconnected { reason, .. } => self.disconnect(reason),
        }
    }

    fn on_timer(&mut self, signal: TimerSignal) {
        if signal.epoch() != self.timer.epoch() {
            return;
        }
        match signal {
            TimerSignal::Tick { attempts, delay, .. } => {
                if self.state() != SessionState::Stopped {
                    return;
                }
                self.events.route(
                    OriginTag::LevelServer,
                    SessionEvent::Reconnecting { attempts, delay },
                );
                self.start_attempt();
            }
            TimerSignal::Exhausted { .. } => {
                self.events
                    .route(OriginTag::LevelServer, SessionEvent::Exhausted);
            }
        }
    }

    /// Every way a connection can end lands here.
    fn disconnect(&mut self, reason: DisconnectReason) {
        tracing::info!("Disconnected from {}: {}", self.config.address(), reason);
        self.teardown();
        self.events.close(OriginTag::TcpClient);

        if self.state() == SessionState::Stopped {
            // A retry failed; the armed timer fires again on its own.
            return;
        }
        self.state.send_replace(SessionState::Stopped);
        if std::mem::take(&mut self.handshaking) {
            // The peer takes connections but never completes a handshake.
            self.timer.start_deferred();
        } else {
            self.timer.start();
        }
    }

    fn start_attempt(&mut self) {
        self.teardown();
        self.handshaking = false;
        self.generation += 1;
        self.attempt = Some(tokio::spawn(run_attempt(
            self.generation,
            self.config.clone(),
            self.link.clone(),
        )));
    }

    /// Aborts the current attempt and discards its stub.
    fn teardown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        if let Some(stub) = self.stub.send_replace(None) {
            stub.close();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.teardown();
        self.timer.stop();
    }
}

/// One connection attempt, from TCP connect to the end of the stream.
async fn run_attempt(
    generation: u64,
    config: Arc<ClientConfig>,
    link: mpsc::UnboundedSender<LinkSignal>,
) {
    let send = |signal: LinkSignal| {
        // The driver outlives every attempt it has not aborted.
        let _ = link.send(signal);
    };
    let report = |err: &ClientError| {
        let (source, kind) = err.origin();
        send(LinkSignal::Error {
            generation,
            source,
            kind,
            message: err.to_string(),
        });
    };

    let stream = match connect_transport(&config).await {
        Ok(stream) => stream,
        Err(e) => {
            report(&e);
            send(LinkSignal::Disconnected {
                generation,
                reason: DisconnectReason::ConnectFailed,
            });
            return;
        }
    };
    send(LinkSignal::Connected { generation });

    let (stub, reader) = match ClientStub::handshake(stream, &config).await {
        Ok((stub, reader)) => (Arc::new(stub), reader),
        Err(e) => {
            report(&e);
            send(LinkSignal::Disconnected {
                generation,
                reason: DisconnectReason::ConnectFailed,
            });
            return;
        }
    };
    send(LinkSignal::Opened {
        generation,
        stub: stub.clone(),
    });

    let read_loop = stub.read_loop(reader, config.idle_timeout);
    tokio::pin!(read_loop);

    let mut ended = None;
    if let Some(credentials) = config.credentials.clone() {
        let auth = stub.call(Operation::Auth, json!({ "credentials": credentials }));
        tokio::select! {
            reason = &mut read_loop => ended = Some(reason),
            result = auth => match result {
                Ok(result) => tracing::info!("Authenticated as {}", result["user"]),
                Err(e) => report(&e),
            },
        }
    }
    let reason = match ended {
        Some(reason) => reason,
        None => read_loop.await,
    };

    match &reason {
        DisconnectReason::Protocol(e) => send(LinkSignal::Error {
            generation,
            source: OriginTag::RpcStream,
            kind: ErrorKind::Protocol,
            message: e.to_string(),
        }),
        DisconnectReason::Io(e) => send(LinkSignal::Error {
            generation,
            source: OriginTag::TcpClient,
            kind: ErrorKind::Transport,
            message: e.to_string(),
        }),
        _ => {}
    }
    send(LinkSignal::Disconnected { generation, reason });
}
