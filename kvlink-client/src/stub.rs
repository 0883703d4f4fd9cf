//! Client-side RPC stub bound to one TCP connection.
//!
//! A stub is created for every connection attempt and discarded with it.
//! Requests are correlated with responses by id; the read half of the
//! socket is drained by [`ClientStub::read_loop`], which the owning
//! session runs until the connection ends.

use crate::config::ClientConfig;
use crate::error::ClientError;
use kvlink_protocol::message::{HelloParams, HelloResult};
use kvlink_protocol::{
    Decoder, Encoder, Manifest, Message, NoticeEvent, Operation, ProtocolError, Request, Response,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Socket read buffer size (8 KiB).
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Why a connection ended.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The TCP connect or the handshake failed.
    ConnectFailed,
    /// The server closed the stream.
    End,
    /// Nothing was received within the idle timeout.
    Timeout,
    /// The server reported that its store closed.
    StoreClosed,
    Io(std::io::Error),
    Protocol(ProtocolError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectFailed => f.write_str("connect failed"),
            DisconnectReason::End => f.write_str("end of stream"),
            DisconnectReason::Timeout => f.write_str("idle timeout"),
            DisconnectReason::StoreClosed => f.write_str("store closed"),
            DisconnectReason::Io(e) => write!(f, "read error: {}", e),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// Opens the TCP transport for one attempt.
pub async fn connect_transport(config: &ClientConfig) -> Result<TcpStream, ClientError> {
    let addr = config.address();
    tracing::debug!("Connecting to {}...", addr);

    let stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| {
        tracing::debug!("Connection to {} timed out", addr);
        ClientError::Timeout
    })??;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// The read side of a connection once the handshake is done.
pub struct StubReader {
    reader: OwnedReadHalf,
    decoder: Decoder,
}

/// RPC stub for one connection.
pub struct ClientStub {
    manifest: Manifest,
    server: HelloResult,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    open: AtomicBool,
}

impl ClientStub {
    /// Runs the HELLO handshake over a fresh transport.
    ///
    /// The response is read directly, before any read loop is running.
    pub async fn handshake(
        stream: TcpStream,
        config: &ClientConfig,
    ) -> Result<(Self, StubReader), ClientError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = Decoder::new();

        let hello = HelloParams {
            protocol_version: PROTOCOL_VERSION,
            client_name: config.client_name.clone(),
        };
        let request = Request::new(0, Operation::Hello).with_params(serde_json::to_value(hello)?);
        writer.write_all(&Encoder::encode_request(&request)?).await?;

        let response = tokio::time::timeout(
            config.request_timeout,
            Self::read_response(&mut reader, &mut decoder),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        let server: HelloResult = serde_json::from_value(response.into_result()?)?;

        let missing = config.manifest.missing_from(&server.manifest);
        if !missing.is_empty() {
            tracing::warn!(
                "Server {} does not expose: {}",
                server.server_name,
                missing.join(", ")
            );
        }
        tracing::debug!(
            "Handshake complete with {} {}",
            server.server_name,
            server.server_version
        );

        let stub = Self {
            manifest: config.manifest.clone(),
            server,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            open: AtomicBool::new(true),
        };
        Ok((stub, StubReader { reader, decoder }))
    }

    async fn read_response(
        reader: &mut OwnedReadHalf,
        decoder: &mut Decoder,
    ) -> Result<Response, ClientError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match decoder.decode_message()? {
                Some(Message::Response(response)) => return Ok(response),
                Some(Message::Notice(_)) => return Err(ClientError::ConnectionClosed),
                Some(Message::Request(_)) => {
                    return Err(ProtocolError::UnexpectedMessage("request").into())
                }
                None => {}
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);
        }
    }

    /// Sends a request and waits for its result.
    pub async fn call(&self, op: Operation, params: Value) -> Result<Value, ClientError> {
        if !self.manifest.allows(op) {
            return Err(ClientError::MethodNotInManifest(op.method_name().to_string()));
        }
        if !self.is_open() {
            return Err(ClientError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, op).with_params(params);
        let encoded = Encoder::encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if !self.is_open() {
                return Err(ClientError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }
        tracing::debug!("Sending request id={} op={}", id, op);

        if let Err(e) = self.writer.lock().await.write_all(&encoded).await {
            self.pending.lock().remove(&id);
            return Err(ClientError::Io(e));
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.pending.lock().remove(&id);
                return Err(ClientError::Timeout);
            }
        };
        Ok(response.into_result()?)
    }

    /// Dispatches responses until the connection ends.
    pub async fn read_loop(
        &self,
        mut reader: StubReader,
        idle_timeout: Option<Duration>,
    ) -> DisconnectReason {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            loop {
                match reader.decoder.decode_message() {
                    Ok(Some(Message::Response(response))) => self.dispatch(response),
                    Ok(Some(Message::Notice(notice))) => match notice.event {
                        NoticeEvent::StoreClosed => {
                            tracing::debug!(
                                "Server store closed: {}",
                                notice.reason.as_deref().unwrap_or("no reason given")
                            );
                            return DisconnectReason::StoreClosed;
                        }
                    },
                    Ok(Some(Message::Request(_))) => {
                        return DisconnectReason::Protocol(ProtocolError::UnexpectedMessage(
                            "request",
                        ))
                    }
                    Ok(None) => break,
                    Err(e) => return DisconnectReason::Protocol(e),
                }
            }

            let read = reader.reader.read(&mut buf);
            let result = match idle_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, read).await {
                    Ok(result) => result,
                    Err(_) => return DisconnectReason::Timeout,
                },
                None => read.await,
            };
            match result {
                Ok(0) => return DisconnectReason::End,
                Ok(n) => reader.decoder.extend(&buf[..n]),
                Err(e) => return DisconnectReason::Io(e),
            }
        }
    }

    fn dispatch(&self, response: Response) {
        match self.pending.lock().remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!("No pending request for id={}", response.id),
        }
    }

    /// Marks the stub closed and fails every pending request.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut pending = self.pending.lock();
            tracing::debug!("Closing stub, failing {} pending requests", pending.len());
            pending.clear();
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// What the server reported in HELLO.
    pub fn server(&self) -> &HelloResult {
        &self.server
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl fmt::Debug for ClientStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStub")
            .field("server", &self.server.server_name)
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}
