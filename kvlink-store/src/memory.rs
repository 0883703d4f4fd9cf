//! In-process store.

use crate::error::StoreError;
use crate::options::StoreOptions;
use crate::store::{ClosedSignal, RangeOptions, Store, StoreFactory, WriteOp};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

type Shared = Arc<RwLock<BTreeMap<String, String>>>;

/// Store kept entirely in memory.
pub struct MemoryStore {
    data: Shared,
    closed: ClosedSignal,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_data(Shared::default())
    }

    fn with_data(data: Shared) -> Self {
        Self {
            data,
            closed: ClosedSignal::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.closed.check()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.batch(vec![WriteOp::put(key, value)])
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.batch(vec![WriteOp::del(key)])
    }

    fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        self.closed.check()?;
        for op in ops {
            op.apply(&mut data);
        }
        Ok(())
    }

    fn range(&self, options: &RangeOptions) -> Result<Vec<(String, String)>, StoreError> {
        self.closed.check()?;
        Ok(options.collect(&self.data.read()))
    }

    fn close(&self) -> Result<(), StoreError> {
        let _data = self.data.write();
        self.closed.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.len())
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

/// Opens [`MemoryStore`]s.
///
/// Stores opened at the same location through one factory share their
/// contents, so data survives a close followed by a reopen.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreFactory {
    locations: Arc<DashMap<String, Shared>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, location: &str, options: &StoreOptions) -> Result<Arc<dyn Store>, StoreError> {
        if let Some(existing) = self.locations.get(location) {
            if options.error_if_exists() {
                return Err(StoreError::AlreadyExists(location.into()));
            }
            return Ok(Arc::new(MemoryStore::with_data(existing.clone())));
        }
        if !options.create_if_missing() {
            return Err(StoreError::NotFound(location.into()));
        }

        let data = self
            .locations
            .entry(location.to_string())
            .or_default()
            .clone();
        Ok(Arc::new(MemoryStore::with_data(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store = MemoryStore::new();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();
        store
            .batch(vec![WriteOp::put("c", "3"), WriteOp::del("b")])
            .unwrap();

        let entries = store.range(&RangeOptions::default()).unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("c".to_string(), "3".to_string())
            ]
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_close() {
        let store = MemoryStore::default();
        let closed = store.closed();
        store.close().unwrap();
        store.close().unwrap();

        assert!(*closed.borrow());
        assert!(matches!(store.del("a"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_factory_shares_location() {
        let factory = MemoryStoreFactory::new();
        let first = factory.open("mem", &StoreOptions::new()).unwrap();
        first.put("k", "v").unwrap();
        first.close().unwrap();

        let second = factory.open("mem", &StoreOptions::new()).unwrap();
        assert!(!second.is_closed());
        assert_eq!(second.get("k").unwrap(), Some("v".to_string()));

        let other = factory.open("other", &StoreOptions::new()).unwrap();
        assert_eq!(other.get("k").unwrap(), None);
    }

    #[test]
    fn test_factory_options() {
        let factory = MemoryStoreFactory::new();
        assert!(matches!(
            factory.open("x", &StoreOptions::new().with("create_if_missing", false)),
            Err(StoreError::NotFound(_))
        ));

        factory.open("x", &StoreOptions::new()).unwrap();
        assert!(matches!(
            factory.open("x", &StoreOptions::new().with("error_if_exists", true)),
            Err(StoreError::AlreadyExists(_))
        ));
    }
}
