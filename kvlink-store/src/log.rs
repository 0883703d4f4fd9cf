//! Directory-backed store.
//!
//! Every mutation is appended to `data.log` as a checksummed record before
//! it is applied to the in-memory ordered map. Opening a store replays the
//! log. A torn record at the tail (an interrupted append) is truncated;
//! damage anywhere before the tail fails the open.

use crate::error::StoreError;
use crate::options::StoreOptions;
use crate::record::LogRecord;
use crate::store::{ClosedSignal, RangeOptions, Store, StoreFactory, WriteOp};
use crate::LOG_FILE_NAME;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What replaying the log found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Records applied.
    pub records: u64,
    /// Bytes dropped from the tail.
    pub bytes_truncated: u64,
}

/// Store persisted as an append-only log.
pub struct LogStore {
    dir: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
    file: Mutex<File>,
    sync: bool,
    recovery: Recovery,
    closed: ClosedSignal,
}

impl LogStore {
    /// Opens (or creates) the store in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let log_path = dir.join(LOG_FILE_NAME);
        let exists = log_path.exists();

        if exists && options.error_if_exists() {
            return Err(StoreError::AlreadyExists(dir.to_path_buf()));
        }
        if !exists {
            if !options.create_if_missing() {
                return Err(StoreError::NotFound(dir.to_path_buf()));
            }
            std::fs::create_dir_all(dir)?;
        }
        for key in options.unrecognized() {
            debug!(key, "ignoring unrecognized store option");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&log_path)?;
        let (data, recovery) = Self::replay(&mut file)?;

        if recovery.bytes_truncated > 0 {
            warn!(
                path = %log_path.display(),
                bytes = recovery.bytes_truncated,
                "truncated torn record at end of log"
            );
        }
        info!(
            path = %dir.display(),
            records = recovery.records,
            keys = data.len(),
            "opened log store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            data: RwLock::new(data),
            file: Mutex::new(file),
            sync: options.sync(),
            recovery,
            closed: ClosedSignal::new(),
        })
    }

    fn replay(file: &mut File) -> Result<(BTreeMap<String, String>, Recovery), StoreError> {
        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut contents)?;
        let file_len = contents.len() as u64;

        let mut buf = BytesMut::from(&contents[..]);
        let mut data = BTreeMap::new();
        let mut recovery = Recovery::default();
        let mut offset = 0u64;

        while let Some(record) = LogRecord::decode(&mut buf, offset)? {
            let ops = record.ops().map_err(|e| StoreError::InvalidRecord {
                offset,
                reason: e.to_string(),
            })?;
            for op in ops {
                op.apply(&mut data);
            }
            offset += record.disk_size() as u64;
            recovery.records += 1;
        }

        if offset < file_len {
            file.set_len(offset)?;
            file.sync_all()?;
            recovery.bytes_truncated = file_len - offset;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((data, recovery))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn recovery(&self) -> Recovery {
        self.recovery
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn write(&self, record: LogRecord, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        self.closed.check()?;

        let encoded = record.encode()?;
        {
            let mut file = self.file.lock();
            file.write_all(&encoded)?;
            if self.sync {
                file.sync_data()?;
            }
        }

        for op in ops {
            op.apply(&mut data);
        }
        Ok(())
    }
}

impl Store for LogStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.data.read();
        self.closed.check()?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let op = WriteOp::put(key, value);
        self.write(LogRecord::single(&op)?, vec![op])
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let op = WriteOp::del(key);
        self.write(LogRecord::single(&op)?, vec![op])
    }

    fn batch(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return self.closed.check();
        }
        self.write(LogRecord::batch(&ops)?, ops)
    }

    fn range(&self, options: &RangeOptions) -> Result<Vec<(String, String)>, StoreError> {
        let data = self.data.read();
        self.closed.check()?;
        Ok(options.collect(&data))
    }

    fn close(&self) -> Result<(), StoreError> {
        let _data = self.data.write();
        if self.closed.close() {
            self.file.lock().sync_all()?;
            info!(path = %self.dir.display(), "closed log store");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStore")
            .field("dir", &self.dir)
            .field("sync", &self.sync)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}

/// Opens [`LogStore`]s, treating the location as a directory path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStoreFactory;

impl StoreFactory for LogStoreFactory {
    fn open(&self, location: &str, options: &StoreOptions) -> Result<Arc<dyn Store>, StoreError> {
        Ok(Arc::new(LogStore::open(location, options)?))
    }
}
