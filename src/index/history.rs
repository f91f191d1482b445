//! Append-only version history
//!
//! One immutable record per observed change, keyed by root, path and
//! timestamp so a prefix scan yields a path's versions oldest first. A
//! rename is stored under both the old and the new path.

use crate::error::{Error, Result};
use crate::index::{root_is_live, File, Scope};
use crate::store::{abort, keys, Store, TxResult, Txn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// What a history record describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    /// First version of a path (or reappearance after deletion)
    Created,
    /// New content for an existing path
    Modified,
    /// Path deleted; history retained
    Deleted,
    /// Content moved from `before_path` to `after_path`
    Renamed,
}

/// One immutable version record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHistory {
    /// Owning root key
    pub root: String,
    /// Previous path, set only for renames
    pub before_path: Option<String>,
    /// Path after the change
    pub after_path: String,
    /// Wall-clock commit time
    pub date: DateTime<Utc>,
    /// Committing client
    pub client: Uuid,
    /// Version timestamp, strictly increasing per path
    pub timestamp: u64,
    /// Content hash after the change
    pub hash: String,
    pub kind: ChangeKind,
}

impl FileHistory {
    /// Whether this record ends the life of `path`
    pub fn removes(&self, path: &str) -> bool {
        match self.kind {
            ChangeKind::Deleted => self.after_path == path,
            ChangeKind::Renamed => self.before_path.as_deref() == Some(path),
            _ => false,
        }
    }
}

/// Read side of the history records under the `h/` namespace
#[derive(Clone)]
pub struct HistoryLog {
    store: Store,
}

impl HistoryLog {
    pub fn new(store: Store) -> Self {
        HistoryLog { store }
    }

    /// Write `record` under its path (and under the source path of a rename).
    /// Only the file index calls this, inside its own transaction.
    pub(crate) fn append(tx: &Txn<'_>, record: &FileHistory) -> TxResult<()> {
        let key = keys::history(&record.root, &record.after_path, record.timestamp);
        if tx.contains(&key)? {
            return abort(Error::Conflict {
                key: format!("{}:{}", record.root, record.after_path),
                latest: record.timestamp,
            });
        }
        tx.put(&key, record)?;

        if let Some(before) = &record.before_path {
            let key = keys::history(&record.root, before, record.timestamp);
            tx.put(&key, record)?;
        }
        Ok(())
    }

    /// Exact version lookup. Never falls back to the latest version.
    pub fn get_version(&self, root: &str, path: &str, timestamp: u64) -> Result<FileHistory> {
        let root_key = keys::root(root);
        let file_key = keys::file(root, path);
        let key = keys::history(root, path, timestamp);
        self.store.transaction(|tx| {
            if !tx.contains(&root_key)? {
                return abort(Error::NotFound(format!("root {}", root)));
            }
            if !tx.contains(&file_key)? {
                return abort(Error::NotFound(format!("file {}:{}", root, path)));
            }
            match tx.get::<FileHistory>(&key)? {
                Some(record) => Ok(record),
                None => abort(Error::NotFound(format!(
                    "version {} of {}:{}",
                    timestamp, root, path
                ))),
            }
        })
    }

    /// Newest record of a path
    pub fn latest(&self, root: &str, path: &str) -> Result<Option<FileHistory>> {
        self.store
            .last_in_prefix(&keys::history_path_prefix(root, path))
    }

    /// Records in scope, oldest first. Records of removed roots or files are
    /// skipped. Across paths a rename is listed once, under its target path
    /// (or under its source when the target has since been removed).
    pub fn list_history(&self, scope: Scope<'_>) -> Result<Vec<FileHistory>> {
        let (prefix, single_path) = match scope {
            Scope::All => (keys::HISTORY_PREFIX.to_vec(), false),
            Scope::Root(root) => (keys::history_root_prefix(root), false),
            Scope::Path { root, path } => (keys::history_path_prefix(root, path), true),
        };

        let mut live_roots: HashMap<String, bool> = HashMap::new();
        let mut live_files: HashMap<(String, String), bool> = HashMap::new();
        let mut out = Vec::new();
        for (key, record) in self.store.scan_prefix::<FileHistory>(&prefix)? {
            let Some((root, path, _)) = keys::parse_history(&key) else {
                continue;
            };
            if !root_is_live(&self.store, &mut live_roots, &root)? {
                continue;
            }
            if !file_is_live(&self.store, &mut live_files, &root, &path)? {
                continue;
            }
            // source-path copy of a rename
            if !single_path
                && path != record.after_path
                && file_is_live(&self.store, &mut live_files, &root, &record.after_path)?
            {
                continue;
            }
            out.push(record);
        }
        out.sort_by_key(|record| record.timestamp);
        Ok(out)
    }

    /// Delete every record of a path. Runs only as part of a file or root
    /// removal.
    pub(crate) fn remove_history(&self, root: &str, path: &str) -> Result<usize> {
        let removed = self
            .store
            .purge_prefix(&keys::history_path_prefix(root, path))?;
        debug!("Removed {} history records of {}:{}", removed, root, path);
        Ok(removed)
    }
}

fn file_is_live(
    store: &Store,
    cache: &mut HashMap<(String, String), bool>,
    root: &str,
    path: &str,
) -> Result<bool> {
    let entry = (root.to_string(), path.to_string());
    if let Some(live) = cache.get(&entry) {
        return Ok(*live);
    }
    let live = store.contains(&keys::file(root, path))?;
    cache.insert(entry, live);
    Ok(live)
}

/// Check the newest history record of `file` against its latest state
pub(crate) fn check_consistency(file: &File, newest: Option<&FileHistory>) -> Result<()> {
    let where_ = format!("{}:{}", file.root, file.path);
    let newest = newest.ok_or_else(|| {
        Error::Corrupted(format!("{} has no history record", where_))
    })?;
    if newest.hash != file.latest_hash || newest.timestamp != file.latest_sync_timestamp {
        return Err(Error::Corrupted(format!(
            "{} latest ({}, {}) disagrees with history ({}, {})",
            where_, file.latest_hash, file.latest_sync_timestamp, newest.hash, newest.timestamp
        )));
    }
    if !file.exists && !newest.removes(&file.path) {
        return Err(Error::Corrupted(format!(
            "{} is tombstoned but its newest record is not a deletion",
            where_
        )));
    }
    Ok(())
}
