//! Method manifests.
//!
//! A manifest lists the store methods a stub is allowed to call. The server
//! answers HELLO with its manifest; a client refuses locally to send a
//! request for a method missing from the manifest it was configured with.
//!
//! On disk and on the wire a manifest is JSON:
//!
//! ```json
//! { "methods": { "get": { "type": "async" }, "range": { "type": "readable" } } }
//! ```

use crate::error::ProtocolError;
use crate::message::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How a method delivers its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MethodKind {
    /// Single request, single response.
    Async,
    /// Returns an ordered sequence of entries.
    Readable,
}

/// Method manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    methods: BTreeMap<String, MethodKind>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::full()
    }
}

impl Manifest {
    /// An empty manifest (only session operations are callable).
    pub fn empty() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }

    /// Every store method.
    pub fn full() -> Self {
        Operation::STORE_METHODS
            .iter()
            .fold(Self::empty(), |m, op| m.with_method(*op))
    }

    /// Store methods that never mutate.
    pub fn read_only() -> Self {
        Operation::STORE_METHODS
            .iter()
            .filter(|op| !op.is_write())
            .fold(Self::empty(), |m, op| m.with_method(*op))
    }

    pub fn with_method(mut self, op: Operation) -> Self {
        if !op.is_session() {
            self.methods
                .insert(op.method_name().to_string(), Self::kind_of(op));
        }
        self
    }

    pub fn without_method(mut self, op: Operation) -> Self {
        self.methods.remove(op.method_name());
        self
    }

    /// Whether a request for `op` may be sent. Session operations always may.
    pub fn allows(&self, op: Operation) -> bool {
        op.is_session() || self.methods.contains_key(op.method_name())
    }

    /// Listed method names with their kinds, in name order.
    pub fn methods(&self) -> impl Iterator<Item = (&str, MethodKind)> {
        self.methods.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Number of listed methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Operations listed in this manifest that `other` lacks.
    pub fn missing_from(&self, other: &Manifest) -> Vec<String> {
        self.methods
            .keys()
            .filter(|name| !other.methods.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Loads a manifest from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the manifest as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn kind_of(op: Operation) -> MethodKind {
        match op {
            Operation::Range => MethodKind::Readable,
            _ => MethodKind::Async,
        }
    }
}
