//! Options passed to `StoreFactory::open`.

use kvlink_core::options;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Storage engine options.
///
/// Holds every key the embedding application passed that the session did
/// not consume itself. Engines read the keys they understand and ignore
/// the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreOptions(Map<String, Value>);

impl StoreOptions {
    /// Keys understood by the bundled engines.
    pub const KNOWN_KEYS: [&'static str; 3] = ["create_if_missing", "error_if_exists", "sync"];

    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Create the store if it does not exist (default `true`).
    pub fn create_if_missing(&self) -> bool {
        options::flag(self.get("create_if_missing"), true)
    }

    /// Fail to open if the store already exists (default `false`).
    pub fn error_if_exists(&self) -> bool {
        options::flag(self.get("error_if_exists"), false)
    }

    /// Fsync after every write (default `false`).
    pub fn sync(&self) -> bool {
        options::flag(self.get("sync"), false)
    }

    /// Keys none of the bundled engines understand.
    pub fn unrecognized(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .map(String::as_str)
            .filter(|k| !Self::KNOWN_KEYS.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = StoreOptions::new();
        assert!(opts.create_if_missing());
        assert!(!opts.error_if_exists());
        assert!(!opts.sync());
        assert!(opts.is_empty());
    }

    #[test]
    fn test_overrides_and_unrecognized() {
        let opts = StoreOptions::new()
            .with("create_if_missing", false)
            .with("sync", "true")
            .with("valueEncoding", "json");
        assert!(!opts.create_if_missing());
        assert!(opts.sync());
        assert_eq!(opts.unrecognized().collect::<Vec<_>>(), vec!["valueEncoding"]);
    }

    #[test]
    fn test_transparent_serde() {
        let opts: StoreOptions = serde_json::from_str(r#"{"sync":true,"cacheSize":8}"#).unwrap();
        assert_eq!(opts.len(), 2);
        assert_eq!(serde_json::to_value(&opts).unwrap()["cacheSize"], 8);
    }
}
