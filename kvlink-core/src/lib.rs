//! # kvlink-core
//!
//! Session primitives shared by the kvlink client and server.
//!
//! This crate provides:
//! - Origin tags identifying which sub-resource raised a signal
//! - The event envelope and router every session publishes through
//! - Session lifecycle states
//! - Option-map parsing shared by client and server configuration

pub mod error;
pub mod event;
pub mod options;
pub mod origin;
pub mod state;

pub use error::ConfigError;
pub use event::{EventEnvelope, EventRouter, SessionEvent, DEFAULT_EVENT_CAPACITY};
pub use options::{OptionMap, DEFAULT_PORT};
pub use origin::{ErrorKind, OriginTag};
pub use state::SessionState;
