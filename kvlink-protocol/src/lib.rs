//! # kvlink-protocol
//!
//! Wire protocol for kvlink: the RPC stream that carries store operations
//! between a client stub and a server stub over one TCP connection.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - JSON request/response/notice envelopes
//! - Per-operation parameter and result types
//! - Method manifests describing which operations a stub may call
//! - Error codes carried in error responses

pub mod codec;
pub mod error;
pub mod frame;
pub mod manifest;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use manifest::{Manifest, MethodKind};
pub use message::{
    Message, Notice, NoticeEvent, Operation, Request, Response, ResponseError, ResponseMeta,
    ResponseStatus,
};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
