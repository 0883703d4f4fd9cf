//! # kvlink-client
//!
//! Client library for kvlink.
//!
//! This crate provides:
//! - A self-healing client session that reconnects on an escalating backoff
//! - Typed store operations over the session's current stream
//! - The backoff timer on its own, for callers with their own retry loops

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
mod session;
pub mod stub;

pub use backoff::{BackoffConfig, BackoffTimer, OverrunPolicy, Strategy, TimerSignal};
pub use client::{Client, Db};
pub use config::ClientConfig;
pub use error::ClientError;
pub use stub::{ClientStub, DisconnectReason};
