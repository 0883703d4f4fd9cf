//! Encoder and decoder for RPC stream messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Message, Notice, Request, Response};
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes any message into a checksummed frame.
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        let mut frame = Frame::from_json(message)?;
        if matches!(message, Message::Notice(_)) {
            frame.flags = frame.flags.with_notice();
        }
        frame.encode()
    }

    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        Self::encode(&Message::Request(request.clone()))
    }

    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        Self::encode(&Message::Response(response.clone()))
    }

    pub fn encode_notice(notice: &Notice) -> Result<BytesMut, ProtocolError> {
        Self::encode(&Message::Notice(notice.clone()))
    }
}

/// Incremental decoder over a byte stream.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => {
                let payload =
                    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(serde_json::from_str(payload)?))
            }
            None => Ok(None),
        }
    }

    /// Attempts to decode the next message, which must be a request.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        match self.decode_message()? {
            Some(Message::Request(request)) => Ok(Some(request)),
            Some(Message::Response(_)) => Err(ProtocolError::UnexpectedMessage("response")),
            Some(Message::Notice(_)) => Err(ProtocolError::UnexpectedMessage("notice")),
            None => Ok(None),
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
