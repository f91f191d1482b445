//! Persistence adapter
//!
//! Thin transactional wrapper over sled. All entity records share one
//! `meta` tree (namespaced by [`keys`]) so a single sled transaction can
//! touch clients, roots, files and history together. Content blobs live in
//! a separate `blobs` tree.

pub mod keys;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{Batch, Db, IVec, Tree};
use std::path::Path;
use tracing::{debug, info};

/// Result type for code running inside a transaction closure
pub type TxResult<T> = std::result::Result<T, ConflictableTransactionError<Error>>;

/// Abort the surrounding transaction with a crate error
pub fn abort<T>(err: Error) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Marker left while a cascade is being purged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepMarker {
    /// Root whose records are being removed
    pub root: String,
    /// Single path being removed, or None for the whole root
    pub path: Option<String>,
}

/// Record counts per namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub clients: usize,
    pub roots: usize,
    pub files: usize,
    pub history: usize,
    pub pending_sweeps: usize,
    pub blobs: usize,
}

/// Sled-backed store shared by every registry
#[derive(Clone)]
pub struct Store {
    /// Sled database
    db: Db,
    /// Clients, roots, files, history, sweep markers
    meta: Tree,
    /// Content blobs keyed by hash
    blobs: Tree,
    /// Keys removed per cascade batch
    cascade_batch: usize,
}

impl Store {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .cache_capacity(config.cache_capacity)
            .flush_every_ms(config.flush_every_ms)
            .temporary(config.temporary)
            .open()?;
        let store = Self::from_db(db, config.cascade_batch)?;

        info!(
            "Store opened at {:?}, {} records",
            path.as_ref(),
            store.meta.len()
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, crate::config::DEFAULT_CASCADE_BATCH)
    }

    fn from_db(db: Db, cascade_batch: usize) -> Result<Self> {
        let meta = db.open_tree("meta")?;
        let blobs = db.open_tree("blobs")?;
        Ok(Store {
            db,
            meta,
            blobs,
            cascade_batch: cascade_batch.max(1),
        })
    }

    /// Override the cascade batch size
    pub fn with_cascade_batch(mut self, cascade_batch: usize) -> Self {
        self.cascade_batch = cascade_batch.max(1);
        self
    }

    /// Tree holding content blobs
    pub fn blob_tree(&self) -> &Tree {
        &self.blobs
    }

    /// Monotonic id from the underlying database
    pub fn generate_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.meta.contains_key(key)?)
    }

    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        self.meta.insert(key, encode(value)?)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.meta.remove(key)?.is_some())
    }

    /// Decode every value under `prefix`, in key order
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<(IVec, T)>> {
        let mut out = Vec::new();
        for entry in self.meta.scan_prefix(prefix) {
            let (key, value) = entry?;
            out.push((key, decode(&value)?));
        }
        Ok(out)
    }

    /// Up to `limit` keys under `prefix`
    pub fn scan_keys(&self, prefix: &[u8], limit: usize) -> Result<Vec<IVec>> {
        self.meta
            .scan_prefix(prefix)
            .keys()
            .take(limit)
            .map(|k| k.map_err(Error::from))
            .collect()
    }

    /// Last value under `prefix` in key order
    pub fn last_in_prefix<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Option<T>> {
        match self.meta.scan_prefix(prefix).next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(decode(&value)?))
            }
            None => Ok(None),
        }
    }

    /// Run `f` atomically. sled re-runs the closure on an internal conflict;
    /// an abort surfaces as the crate error it carried.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Txn<'_>) -> TxResult<T>,
    {
        let result = self.meta.transaction(|tree| f(&Txn { tree }));
        Ok(result?)
    }

    /// Remove every key under `prefix`, `cascade_batch` keys per atomic batch.
    /// Returns the number of keys removed.
    pub fn purge_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut removed = 0;
        loop {
            let keys = self.scan_keys(prefix, self.cascade_batch)?;
            if keys.is_empty() {
                break;
            }
            let mut batch = Batch::default();
            for key in &keys {
                batch.remove(key.clone());
            }
            self.meta.apply_batch(batch)?;
            removed += keys.len();
        }
        debug!("Purged {} keys", removed);
        Ok(removed)
    }

    /// Record counts per namespace
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |prefix: &[u8]| self.meta.scan_prefix(prefix).keys().count();
        Ok(StoreStats {
            clients: count(keys::CLIENT_PREFIX),
            roots: count(keys::ROOT_PREFIX),
            files: count(keys::FILE_PREFIX),
            history: count(keys::HISTORY_PREFIX),
            pending_sweeps: count(keys::SWEEP_PREFIX),
            blobs: self.blobs.len(),
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Typed view of the metadata tree inside a transaction
pub struct Txn<'a> {
    tree: &'a TransactionalTree,
}

impl Txn<'_> {
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> TxResult<Option<T>> {
        match self.tree.get(key)? {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(ConflictableTransactionError::Abort),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> TxResult<bool> {
        Ok(self.tree.get(key)?.is_some())
    }

    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> TxResult<()> {
        let bytes = encode(value).map_err(ConflictableTransactionError::Abort)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> TxResult<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        n: u64,
    }

    fn rec(name: &str, n: u64) -> Record {
        Record {
            name: name.to_string(),
            n,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let store = Store::in_memory().unwrap();
        store.put(b"k1", &rec("a", 1)).unwrap();

        assert_eq!(store.get::<Record>(b"k1").unwrap(), Some(rec("a", 1)));
        assert!(store.contains(b"k1").unwrap());
        assert!(store.delete(b"k1").unwrap());
        assert!(!store.delete(b"k1").unwrap());
        assert!(store.get::<Record>(b"k1").unwrap().is_none());
    }

    #[test]
    fn test_transaction_commits_all_writes() {
        let store = Store::in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.put(b"x/1", &rec("one", 1))?;
                tx.put(b"x/2", &rec("two", 2))?;
                Ok(())
            })
            .unwrap();

        let all = store.scan_prefix::<Record>(b"x/").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].1, rec("two", 2));
    }

    #[test]
    fn test_abort_rolls_back() {
        let store = Store::in_memory().unwrap();
        store.put(b"x/keep", &rec("keep", 0)).unwrap();

        let err = store
            .transaction(|tx| {
                tx.put(b"x/new", &rec("new", 1))?;
                tx.delete(b"x/keep")?;
                abort::<()>(Error::NotFound("missing".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.contains(b"x/keep").unwrap());
        assert!(!store.contains(b"x/new").unwrap());
    }

    #[test]
    fn test_purge_prefix_in_batches() {
        let store = Store::in_memory().unwrap().with_cascade_batch(3);
        for i in 0..10u64 {
            let mut key = b"p/".to_vec();
            key.extend_from_slice(&i.to_be_bytes());
            store.put(&key, &i).unwrap();
        }
        store.put(b"q/other", &99u64).unwrap();

        assert_eq!(store.purge_prefix(b"p/").unwrap(), 10);
        assert!(store.scan_keys(b"p/", 100).unwrap().is_empty());
        assert!(store.contains(b"q/other").unwrap());
    }

    #[test]
    fn test_last_in_prefix() {
        let store = Store::in_memory().unwrap();
        for ts in [3u64, 1, 2] {
            store.put(&keys::history("/r", "f", ts), &ts).unwrap();
        }
        let last: Option<u64> = store
            .last_in_prefix(&keys::history_path_prefix("/r", "f"))
            .unwrap();
        assert_eq!(last, Some(3));
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            flush_every_ms: None,
            ..StorageConfig::default()
        };
        {
            let store = Store::open(dir.path(), &config).unwrap();
            store.put(b"k", &rec("persisted", 7)).unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(dir.path(), &config).unwrap();
        assert_eq!(store.get::<Record>(b"k").unwrap(), Some(rec("persisted", 7)));
    }
}
