//! Latest-known state per path
//!
//! `observe_version` is the reconciliation step for every sync event: it
//! authorizes the client, compares the incoming hash and existence flag with
//! the stored state, appends a history record when something changed and
//! moves the latest pointer, all inside one transaction.

use crate::error::{Error, Result};
use crate::index::history::{ChangeKind, FileHistory, HistoryLog};
use crate::index::{root_is_live, Scope};
use crate::registry::RootDirectory;
use crate::store::{abort, keys, Store, SweepMarker, TxResult, Txn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Filesystem metadata snapshot reported by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    /// Modification time on the client
    pub mod_time: Option<DateTime<Utc>>,
    /// Size in bytes
    pub size: u64,
    /// Permission bits
    pub mode: u32,
}

/// Latest known state of one path within one root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct File {
    /// Owning root key
    pub root: String,
    /// Path relative to the root
    pub path: String,
    /// Hash of the newest history record
    pub latest_hash: String,
    /// Timestamp of the newest history record
    pub latest_sync_timestamp: u64,
    /// False once the newest record is a deletion (tombstone)
    pub exists: bool,
    pub metadata: FileMetadata,
}

/// How the version timestamp of an observation is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStamp {
    /// Use this timestamp; it must exceed every committed one for the path
    Exact(u64),
    /// Allocate `latest + 1` inside the transaction
    Next,
}

/// One observed state of a path, as reported by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub root: String,
    pub path: String,
    pub client: Uuid,
    /// Content hash after the change
    pub hash: String,
    pub stamp: VersionStamp,
    pub metadata: FileMetadata,
    /// False when the event is a deletion
    pub exists: bool,
    /// Source path when the event is a rename
    pub renamed_from: Option<String>,
}

impl Observation {
    /// A create or modify event
    pub fn write(root: &str, path: &str, client: Uuid, hash: &str, stamp: VersionStamp) -> Self {
        Observation {
            root: root.to_string(),
            path: path.to_string(),
            client,
            hash: hash.to_string(),
            stamp,
            metadata: FileMetadata::default(),
            exists: true,
            renamed_from: None,
        }
    }

    /// A deletion event
    pub fn delete(root: &str, path: &str, client: Uuid, hash: &str, stamp: VersionStamp) -> Self {
        Observation {
            exists: false,
            ..Self::write(root, path, client, hash, stamp)
        }
    }

    /// A rename of `from` to `path`
    pub fn rename(
        root: &str,
        from: &str,
        path: &str,
        client: Uuid,
        hash: &str,
        stamp: VersionStamp,
    ) -> Self {
        Observation {
            renamed_from: Some(from.to_string()),
            ..Self::write(root, path, client, hash, stamp)
        }
    }

    pub fn with_metadata(mut self, metadata: FileMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of reconciling an observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A new version was appended
    Recorded(FileHistory),
    /// Same content and existence as the latest version; nothing appended
    Duplicate(File),
}

impl Decision {
    /// Whether a new version was recorded (and should be propagated)
    pub fn is_recorded(&self) -> bool {
        matches!(self, Decision::Recorded(_))
    }
}

/// File records under the `f/` namespace
#[derive(Clone)]
pub struct FileIndex {
    store: Store,
    history: HistoryLog,
}

impl FileIndex {
    pub fn new(store: Store) -> Self {
        let history = HistoryLog::new(store.clone());
        FileIndex { store, history }
    }

    /// Reconcile one observed version of a path.
    ///
    /// # Arguments
    /// * `obs` - The observed state; `obs.client` must be a member of `obs.root`
    ///
    /// # Returns
    /// `Decision::Recorded` with the appended record when the hash or the
    /// existence flag changed (or the path is new, or this is a rename);
    /// otherwise `Decision::Duplicate`, after refreshing the stored metadata.
    ///
    /// # Errors
    /// * `InvalidArgument` - empty path, a rename that is also a deletion, or
    ///   no timestamp left above the latest one for `VersionStamp::Next`
    /// * `NotFound` - unknown root, or a rename source that does not exist
    /// * `Unauthorized` - the client is not a member of the root
    /// * `Conflict` - an exact timestamp not above the latest committed one,
    ///   or the path is being purged; re-submit with a greater timestamp
    pub fn observe_version(&self, obs: &Observation) -> Result<Decision> {
        if obs.path.is_empty() {
            return Err(Error::InvalidArgument("path must not be empty".to_string()));
        }
        if obs.renamed_from.is_some() && !obs.exists {
            return Err(Error::InvalidArgument(format!(
                "rename to {}:{} cannot be a deletion",
                obs.root, obs.path
            )));
        }
        let rename_from = obs
            .renamed_from
            .as_deref()
            .filter(|from| *from != obs.path.as_str());

        let root_key = keys::root(&obs.root);
        let file_key = keys::file(&obs.root, &obs.path);
        let decision = self.store.transaction(|tx| {
            let root: RootDirectory = match tx.get(&root_key)? {
                Some(root) => root,
                None => return abort(Error::NotFound(format!("root {}", obs.root))),
            };
            if !root.is_member(&obs.client) {
                return abort(Error::Unauthorized(format!(
                    "client {} is not a member of {}",
                    obs.client, obs.root
                )));
            }
            ensure_not_purging(tx, &obs.root, &obs.path)?;

            let current: Option<File> = tx.get(&file_key)?;
            let source = match rename_from {
                Some(from) => {
                    ensure_not_purging(tx, &obs.root, from)?;
                    match tx.get::<File>(&keys::file(&obs.root, from))? {
                        Some(file) if file.exists => Some(file),
                        _ => {
                            return abort(Error::NotFound(format!(
                                "rename source {}:{}",
                                obs.root, from
                            )))
                        }
                    }
                }
                None => None,
            };

            if let Some(file) = &current {
                if source.is_none() && file.exists == obs.exists && file.latest_hash == obs.hash {
                    let mut file = file.clone();
                    if file.metadata != obs.metadata {
                        file.metadata = obs.metadata.clone();
                        tx.put(&file_key, &file)?;
                    }
                    return Ok(Decision::Duplicate(file));
                }
            }

            let floor = current
                .iter()
                .chain(source.iter())
                .map(|f| f.latest_sync_timestamp)
                .max()
                .unwrap_or(0);
            let timestamp = match obs.stamp {
                VersionStamp::Exact(ts) if ts > floor => ts,
                VersionStamp::Exact(_) => {
                    return abort(Error::Conflict {
                        key: format!("{}:{}", obs.root, obs.path),
                        latest: floor,
                    })
                }
                VersionStamp::Next => match floor.checked_add(1) {
                    Some(ts) => ts,
                    None => {
                        return abort(Error::InvalidArgument(format!(
                            "no timestamp left after {} for {}:{}",
                            floor, obs.root, obs.path
                        )))
                    }
                },
            };

            let kind = if source.is_some() {
                ChangeKind::Renamed
            } else if !obs.exists {
                ChangeKind::Deleted
            } else if current.as_ref().map_or(true, |f| !f.exists) {
                ChangeKind::Created
            } else {
                ChangeKind::Modified
            };

            let record = FileHistory {
                root: obs.root.clone(),
                before_path: source.as_ref().map(|f| f.path.clone()),
                after_path: obs.path.clone(),
                date: Utc::now(),
                client: obs.client,
                timestamp,
                hash: obs.hash.clone(),
                kind,
            };
            HistoryLog::append(tx, &record)?;

            if let Some(mut moved) = source {
                moved.latest_hash = record.hash.clone();
                moved.latest_sync_timestamp = timestamp;
                moved.exists = false;
                tx.put(&keys::file(&obs.root, &moved.path), &moved)?;
            }

            let file = File {
                root: obs.root.clone(),
                path: obs.path.clone(),
                latest_hash: obs.hash.clone(),
                latest_sync_timestamp: timestamp,
                exists: obs.exists,
                metadata: obs.metadata.clone(),
            };
            tx.put(&file_key, &file)?;

            Ok(Decision::Recorded(record))
        })?;

        match &decision {
            Decision::Recorded(record) => info!(
                "Recorded {:?} of {}:{} at {} by {}",
                record.kind, record.root, record.after_path, record.timestamp, record.client
            ),
            Decision::Duplicate(file) => debug!(
                "Duplicate observation of {}:{} (latest {})",
                file.root, file.path, file.latest_sync_timestamp
            ),
        }
        Ok(decision)
    }

    /// Latest state of a path
    pub fn get_latest(&self, root: &str, path: &str) -> Result<File> {
        let root_key = keys::root(root);
        let file_key = keys::file(root, path);
        self.store.transaction(|tx| {
            if !tx.contains(&root_key)? {
                return abort(Error::NotFound(format!("root {}", root)));
            }
            match tx.get::<File>(&file_key)? {
                Some(file) => Ok(file),
                None => abort(Error::NotFound(format!("file {}:{}", root, path))),
            }
        })
    }

    /// Files in scope, tombstones included. Files of removed roots are skipped.
    pub fn list_files(&self, scope: Scope<'_>) -> Result<Vec<File>> {
        let prefix = match scope {
            Scope::All => keys::FILE_PREFIX.to_vec(),
            Scope::Root(root) => keys::file_root_prefix(root),
            Scope::Path { root, path } => {
                return match self.get_latest(root, path) {
                    Ok(file) => Ok(vec![file]),
                    Err(Error::NotFound(_)) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
        };

        let mut live_roots = HashMap::new();
        let mut out = Vec::new();
        for (_, file) in self.store.scan_prefix::<File>(&prefix)? {
            if root_is_live(&self.store, &mut live_roots, &file.root)? {
                out.push(file);
            }
        }
        Ok(out)
    }

    /// Erase a file and all of its history (unlike a synced deletion, which
    /// only tombstones it). Returns the number of history records removed.
    pub fn remove_file(&self, root: &str, path: &str) -> Result<usize> {
        let root_key = keys::root(root);
        let file_key = keys::file(root, path);
        let marker_key = keys::sweep(root, Some(path));
        let marker = SweepMarker {
            root: root.to_string(),
            path: Some(path.to_string()),
        };

        self.store.transaction(|tx| {
            if !tx.contains(&root_key)? {
                return abort(Error::NotFound(format!("root {}", root)));
            }
            if !tx.delete(&file_key)? {
                return abort(Error::NotFound(format!("file {}:{}", root, path)));
            }
            tx.put(&marker_key, &marker)
        })?;

        let removed = self.history.remove_history(root, path)?;
        self.store.delete(&marker_key)?;

        info!("Removed file {}:{} ({} history records)", root, path, removed);
        Ok(removed)
    }

    /// Erase every file in scope. Returns how many files were removed.
    pub fn remove_all_files(&self, scope: Scope<'_>) -> Result<usize> {
        let mut removed = 0;
        for file in self.list_files(scope)? {
            match self.remove_file(&file.root, &file.path) {
                Ok(_) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// Fail with a retryable conflict while `path` (or its root) is being purged
fn ensure_not_purging(tx: &Txn<'_>, root: &str, path: &str) -> TxResult<()> {
    if tx.contains(&keys::sweep(root, Some(path)))? {
        return abort(Error::Conflict {
            key: format!("{}:{}", root, path),
            latest: 0,
        });
    }
    Ok(())
}
