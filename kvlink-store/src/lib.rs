//! # kvlink-store
//!
//! Storage engines a kvlink server exposes over the network.
//!
//! This crate provides:
//! - The [`Store`] and [`StoreFactory`] traits the server is written against
//! - [`LogStore`], a directory-backed engine replaying a checksummed
//!   append-only log into an ordered map
//! - [`MemoryStore`], an in-process engine for tests and embedding
//! - [`StoreOptions`], the verbatim option map handed to `open`

pub mod error;
pub mod log;
pub mod memory;
pub mod options;
pub mod record;
pub mod store;

pub use error::StoreError;
pub use log::{LogStore, LogStoreFactory};
pub use memory::{MemoryStore, MemoryStoreFactory};
pub use options::StoreOptions;
pub use store::{ClosedSignal, RangeOptions, Store, StoreFactory, WriteOp};

/// Name of the log file inside a store directory.
pub const LOG_FILE_NAME: &str = "data.log";

/// Log record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;
