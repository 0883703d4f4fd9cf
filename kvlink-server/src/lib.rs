//! # kvlink-server
//!
//! TCP server for kvlink.
//!
//! This crate provides:
//! - The server session: idempotent start/stop of the store and listener
//! - One RPC server stub per accepted connection
//! - Authentication and access hooks, with password and writer-list built-ins
//! - Daemon configuration from YAML and environment variables

pub mod config;
pub mod error;
pub mod hooks;
pub mod server;
pub mod session;
pub mod stub;

pub use config::{AccessConfig, AuthConfig, DaemonConfig};
pub use error::ServerError;
pub use hooks::{AccessPolicy, Authenticator, Hooks, PasswordAuthenticator, WriterPolicy};
pub use server::{Server, ServerConfig, DEFAULT_HOST};
pub use session::ConnectionSession;
pub use stub::{ServerInfo, ServerStub};
