//! Store and factory traits.

use crate::error::StoreError;
use crate::options::StoreOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::watch;

/// One mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteOp {
    Put { key: String, value: String },
    Del { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        WriteOp::Del { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Del { key } => key,
        }
    }

    /// Applies the mutation to an ordered map.
    pub(crate) fn apply(self, map: &mut BTreeMap<String, String>) {
        match self {
            WriteOp::Put { key, value } => {
                map.insert(key, value);
            }
            WriteOp::Del { key } => {
                map.remove(&key);
            }
        }
    }
}

/// Bounds and direction for a range read. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub gte: Option<String>,
    pub lte: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl RangeOptions {
    /// Collects matching entries from an ordered map.
    pub(crate) fn collect(&self, map: &BTreeMap<String, String>) -> Vec<(String, String)> {
        if let (Some(gte), Some(lte)) = (&self.gte, &self.lte) {
            if gte > lte {
                return Vec::new();
            }
        }

        let lower = self
            .gte
            .as_deref()
            .map_or(Bound::Unbounded, Bound::Included);
        let upper = self
            .lte
            .as_deref()
            .map_or(Bound::Unbounded, Bound::Included);
        let range = map.range::<str, _>((lower, upper));
        let limit = self.limit.unwrap_or(usize::MAX);

        let clone = |(k, v): (&String, &String)| (k.clone(), v.clone());
        if self.reverse {
            range.rev().take(limit).map(clone).collect()
        } else {
            range.take(limit).map(clone).collect()
        }
    }
}

/// An ordered key-value store.
///
/// Implementations are internally synchronized. Once closed, every
/// operation fails with [`StoreError::Closed`].
pub trait Store: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Applies all operations atomically, in order.
    fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn range(&self, options: &RangeOptions) -> Result<Vec<(String, String)>, StoreError>;

    /// Closes the store. Closing twice is a no-op.
    fn close(&self) -> Result<(), StoreError>;

    fn is_closed(&self) -> bool;

    /// Receiver that flips to `true` exactly once, when the store closes.
    fn closed(&self) -> watch::Receiver<bool>;
}

/// Opens stores by location.
pub trait StoreFactory: Send + Sync {
    fn open(&self, location: &str, options: &StoreOptions) -> Result<Arc<dyn Store>, StoreError>;
}

impl<F> StoreFactory for F
where
    F: Fn(&str, &StoreOptions) -> Result<Arc<dyn Store>, StoreError> + Send + Sync,
{
    fn open(&self, location: &str, options: &StoreOptions) -> Result<Arc<dyn Store>, StoreError> {
        self(location, options)
    }
}

/// Terminal closed flag shared by the bundled engines.
#[derive(Debug)]
pub struct ClosedSignal {
    sender: watch::Sender<bool>,
}

impl ClosedSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Marks the signal closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        self.sender.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Returns `Err(StoreError::Closed)` once closed.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for ClosedSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<String, String> {
        ["a", "b", "c", "d", "e"]
            .iter()
            .map(|k| (k.to_string(), k.to_uppercase()))
            .collect()
    }

    fn keys(entries: Vec<(String, String)>) -> Vec<String> {
        entries.into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let opts = RangeOptions {
            gte: Some("b".into()),
            lte: Some("d".into()),
            ..Default::default()
        };
        assert_eq!(keys(opts.collect(&sample())), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_range_reverse_with_limit() {
        let opts = RangeOptions {
            limit: Some(2),
            reverse: true,
            ..Default::default()
        };
        assert_eq!(keys(opts.collect(&sample())), vec!["e", "d"]);
    }

    #[test]
    fn test_range_inverted_bounds_is_empty() {
        let opts = RangeOptions {
            gte: Some("d".into()),
            lte: Some("b".into()),
            ..Default::default()
        };
        assert!(opts.collect(&sample()).is_empty());
    }

    #[test]
    fn test_write_op_apply() {
        let mut map = sample();
        WriteOp::put("z", "Z").apply(&mut map);
        WriteOp::del("a").apply(&mut map);
        assert_eq!(map.get("z").map(String::as_str), Some("Z"));
        assert!(!map.contains_key("a"));
    }

    #[test]
    fn test_closed_signal_fires_once() {
        let signal = ClosedSignal::new();
        let rx = signal.subscribe();
        assert!(signal.check().is_ok());

        assert!(signal.close());
        assert!(!signal.close());
        assert!(*rx.borrow());
        assert!(matches!(signal.check(), Err(StoreError::Closed)));
    }
}
