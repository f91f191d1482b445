//! Metadata engine
//!
//! Wires the store, registries, file index, history log and content store
//! together. Sync events enter through [`Engine::record_event`], which adds
//! conflict retries on top of [`FileIndex::observe_version`].

use crate::config::Config;
use crate::content::{BlobStore, ContentStore};
use crate::error::{Error, Result};
use crate::index::{
    check_consistency, root_is_live, Decision, FileIndex, HistoryLog, Observation, Scope,
    VersionStamp,
};
use crate::registry::{purge_root, ClientRegistry, DirectoryRegistry};
use crate::retry::ExponentialBackoff;
use crate::store::{abort, keys, Store, StoreStats, SweepMarker};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a sweep cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Interrupted or orphaned cascades completed
    pub cascades: usize,
    /// File records removed
    pub files: usize,
    /// History records removed
    pub history: usize,
}

/// The metadata and version-history engine
pub struct Engine {
    /// Configuration
    config: Arc<Config>,
    /// Persistence adapter
    store: Store,
    clients: ClientRegistry,
    directories: DirectoryRegistry,
    files: FileIndex,
    history: HistoryLog,
    /// Blob collaborator for downloads
    content: Arc<dyn ContentStore>,
}

impl Engine {
    /// Open the store described by `config` and finish any interrupted cascade
    pub fn open(config: Config) -> Result<Self> {
        let store = if config.storage.temporary {
            Store::in_memory()?.with_cascade_batch(config.storage.cascade_batch)
        } else {
            config.ensure_directories()?;
            Store::open(config.database_path(), &config.storage)?
        };
        let content = Arc::new(BlobStore::new(&store));
        Self::with_content(config, store, content)
    }

    /// Build an engine over an existing store and content collaborator.
    ///
    /// Cascades left pending by an earlier process are finished here, so
    /// nothing else may be using `store` yet.
    pub fn with_content(
        config: Config,
        store: Store,
        content: Arc<dyn ContentStore>,
    ) -> Result<Self> {
        let directories = DirectoryRegistry::new(store.clone(), &config.security)?;
        let engine = Engine {
            config: Arc::new(config),
            clients: ClientRegistry::new(store.clone()),
            directories,
            files: FileIndex::new(store.clone()),
            history: HistoryLog::new(store.clone()),
            content,
            store,
        };

        let finished = engine.sweep_pending()?;
        if finished.cascades > 0 {
            info!("Finished {} interrupted cascades", finished.cascades);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn directories(&self) -> &DirectoryRegistry {
        &self.directories
    }

    pub fn files(&self) -> &FileIndex {
        &self.files
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    /// Record one sync event.
    ///
    /// A conflict on an exact timestamp is retried with a timestamp above the
    /// latest committed one, waiting between attempts per the retry config.
    /// Once the budget is spent the conflict is returned.
    pub fn record_event(&self, event: Observation) -> Result<Decision> {
        let mut event = event;
        let mut backoff = ExponentialBackoff::from_config(&self.config.retry);
        loop {
            match self.files.observe_version(&event) {
                Err(Error::Conflict { key, latest }) => {
                    let Some(delay) = backoff.next_delay() else {
                        warn!(
                            "Giving up on {} after {} retries",
                            key,
                            backoff.attempts()
                        );
                        return Err(Error::Conflict { key, latest });
                    };
                    if let VersionStamp::Exact(ts) = event.stamp {
                        if ts <= latest {
                            let Some(next) = latest.checked_add(1) else {
                                warn!("No timestamp left after {} for {}", latest, key);
                                return Err(Error::Conflict { key, latest });
                            };
                            event.stamp = VersionStamp::Exact(next);
                        }
                    }
                    debug!(
                        "Conflict on {}, retry {} in {:?}",
                        key,
                        backoff.attempts(),
                        delay
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Store file content and return its hash
    pub fn put_content(&self, data: &[u8]) -> Result<String> {
        self.content.put(data)
    }

    /// Content of `path` as of version `timestamp`.
    ///
    /// Fails `NotFound` when that version was never committed (there is no
    /// fallback to the latest version) or when it records a deletion, and
    /// `Corrupted` when the version's hash has no stored content.
    pub fn download(&self, root: &str, path: &str, timestamp: u64) -> Result<Vec<u8>> {
        let record = self.history.get_version(root, path, timestamp)?;
        if record.removes(path) {
            return Err(Error::NotFound(format!(
                "version {} of {}:{} is a deletion",
                timestamp, root, path
            )));
        }
        match self.content.get(&record.hash)? {
            Some(data) => Ok(data),
            None => Err(Error::Corrupted(format!(
                "no content for hash {} ({}:{} at {})",
                record.hash, root, path, timestamp
            ))),
        }
    }

    /// Write a version's content to `target`. Returns the number of bytes written.
    pub fn download_to<P: AsRef<Path>>(
        &self,
        root: &str,
        path: &str,
        timestamp: u64,
        target: P,
    ) -> Result<u64> {
        let data = self.download(root, path, timestamp)?;
        std::fs::write(target.as_ref(), &data)?;
        info!(
            "Downloaded {}:{}@{} to {:?} ({} bytes)",
            root,
            path,
            timestamp,
            target.as_ref(),
            data.len()
        );
        Ok(data.len() as u64)
    }

    /// Check every file of a root against its history. Returns how many
    /// files were checked.
    pub fn verify_root(&self, root: &str) -> Result<usize> {
        self.directories.get_root(root)?;
        let files = self.files.list_files(Scope::Root(root))?;
        for file in &files {
            let newest = self.history.latest(root, &file.path)?;
            check_consistency(file, newest.as_ref())?;
        }
        debug!("Verified {} files of {}", files.len(), root);
        Ok(files.len())
    }

    /// Remove file records of missing roots and history records of missing
    /// files. Roots and paths with a sweep marker belong to a removal that
    /// is still running and are left to it.
    pub fn sweep_orphans(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let mut live_roots = HashMap::new();
        let mut dead_roots = BTreeSet::new();
        for key in self.store.scan_keys(keys::FILE_PREFIX, usize::MAX)? {
            if let Some((root, _)) = keys::parse_file(&key) {
                if !root_is_live(&self.store, &mut live_roots, &root)? {
                    dead_roots.insert(root);
                }
            }
        }

        let mut orphan_paths = BTreeSet::new();
        for key in self.store.scan_keys(keys::HISTORY_PREFIX, usize::MAX)? {
            let Some((root, path, _)) = keys::parse_history(&key) else {
                continue;
            };
            if !root_is_live(&self.store, &mut live_roots, &root)? {
                dead_roots.insert(root);
            } else if !self.store.contains(&keys::file(&root, &path))? {
                orphan_paths.insert((root, path));
            }
        }

        for root in dead_roots {
            if self.detach(&root, None)? {
                let purged = purge_root(&self.store, &root)?;
                report.cascades += 1;
                report.files += purged.files;
                report.history += purged.history;
            }
        }

        for (root, path) in orphan_paths {
            if self.detach(&root, Some(&path))? {
                report.history += self.history.remove_history(&root, &path)?;
                self.store.delete(&keys::sweep(&root, Some(&path)))?;
                report.cascades += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                "Sweep removed {} files and {} history records ({} cascades)",
                report.files, report.history, report.cascades
            );
        }
        Ok(report)
    }

    /// Record counts per namespace
    pub fn status(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Complete every cascade whose sweep marker is still present. Only safe
    /// before the engine is shared: a marker may belong to a live removal.
    fn sweep_pending(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for (key, marker) in self.store.scan_prefix::<SweepMarker>(keys::SWEEP_PREFIX)? {
            match &marker.path {
                None => {
                    if self.store.contains(&keys::root(&marker.root))? {
                        warn!("Root {} is live, dropping its sweep marker", marker.root);
                    } else {
                        let purged = purge_root(&self.store, &marker.root)?;
                        report.files += purged.files;
                        report.history += purged.history;
                        report.cascades += 1;
                    }
                }
                Some(path) => {
                    if self.store.contains(&keys::file(&marker.root, path))? {
                        warn!("File {}:{} is live, dropping its sweep marker", marker.root, path);
                    } else {
                        report.history += self.history.remove_history(&marker.root, path)?;
                        report.cascades += 1;
                    }
                }
            }
            self.store.delete(&key)?;
        }
        Ok(report)
    }

    /// Leave a sweep marker for an orphaned root (or path) so that no new
    /// record can appear under it while it is purged. Returns false when the
    /// root (or file) came back in the meantime, or when another removal
    /// already owns it.
    fn detach(&self, root: &str, path: Option<&str>) -> Result<bool> {
        let owner_key = match path {
            Some(path) => keys::file(root, path),
            None => keys::root(root),
        };
        let marker_key = keys::sweep(root, path);
        let marker = SweepMarker {
            root: root.to_string(),
            path: path.map(str::to_string),
        };
        self.store.transaction(|tx| {
            if tx.contains(&owner_key)? || tx.contains(&marker_key)? {
                return Ok(false);
            }
            if path.is_some() && !tx.contains(&keys::root(root))? {
                return abort(Error::NotFound(format!("root {}", root)));
            }
            tx.put(&marker_key, &marker)?;
            Ok(true)
        })
        .or_else(|e| if e.is_not_found() { Ok(false) } else { Err(e) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChangeKind, File};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn engine() -> Engine {
        Engine::open(Config::for_testing()).unwrap()
    }

    fn member(engine: &Engine, root: &str) -> Uuid {
        let client = engine.clients().register_client("10.0.0.1:4000").unwrap();
        if engine.directories().get_root(root).is_err() {
            engine.directories().register_root(root, "alice", "p1").unwrap();
        }
        engine.directories().join_root(root, &client.uuid, "p1").unwrap();
        client.uuid
    }

    #[test]
    fn test_docs_scenario() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        let event = |hash: &str, ts: u64| {
            Observation::write("/docs", "notes.txt", c1, hash, VersionStamp::Exact(ts))
        };

        assert!(engine.record_event(event("h1", 100)).unwrap().is_recorded());
        assert!(!engine.record_event(event("h1", 101)).unwrap().is_recorded());
        assert_eq!(
            engine
                .files()
                .get_latest("/docs", "notes.txt")
                .unwrap()
                .latest_sync_timestamp,
            100
        );

        assert!(engine.record_event(event("h2", 102)).unwrap().is_recorded());
        let latest = engine.files().get_latest("/docs", "notes.txt").unwrap();
        assert_eq!(latest.latest_hash, "h2");
        assert_eq!(latest.latest_sync_timestamp, 102);

        assert_eq!(
            engine.history().get_version("/docs", "notes.txt", 100).unwrap().hash,
            "h1"
        );

        engine.directories().remove_root("/docs").unwrap();
        assert!(engine
            .files()
            .get_latest("/docs", "notes.txt")
            .unwrap_err()
            .is_not_found());
        assert!(engine.files().list_files(Scope::Root("/docs")).unwrap().is_empty());
    }

    #[test]
    fn test_record_event_retries_stale_timestamp() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(50)))
            .unwrap();

        let decision = engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h2", VersionStamp::Exact(50)))
            .unwrap();
        match decision {
            Decision::Recorded(record) => {
                assert_eq!(record.timestamp, 51);
                assert_eq!(record.kind, ChangeKind::Modified);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_record_event_at_timestamp_limit() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(u64::MAX)))
            .unwrap();

        match engine.record_event(Observation::write("/docs", "a.txt", c1, "h2", VersionStamp::Exact(7))) {
            Err(Error::Conflict { latest, .. }) => assert_eq!(latest, u64::MAX),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(matches!(
            engine.record_event(Observation::write("/docs", "a.txt", c1, "h2", VersionStamp::Next)),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(engine.files().get_latest("/docs", "a.txt").unwrap().latest_hash, "h1");
    }

    #[test]
    fn test_concurrent_events_same_timestamp() {
        let mut config = Config::for_testing();
        config.retry.max_attempts = 16;
        let engine = Engine::open(config).unwrap();
        let c1 = member(&engine, "/docs");

        let results: Vec<Result<Decision>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let engine = &engine;
                    scope.spawn(move || {
                        let hash = format!("h{}", i);
                        engine.record_event(Observation::write(
                            "/docs",
                            "race.txt",
                            c1,
                            &hash,
                            VersionStamp::Exact(100),
                        ))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut stamps: Vec<u64> = results
            .into_iter()
            .map(|result| match result.unwrap() {
                Decision::Recorded(record) => record.timestamp,
                other => panic!("expected record, got {:?}", other),
            })
            .collect();
        stamps.sort_unstable();
        assert_eq!(stamps.iter().filter(|ts| **ts == 100).count(), 1);
        stamps.dedup();
        assert_eq!(stamps.len(), 8);

        let history = engine
            .history()
            .list_history(Scope::Path {
                root: "/docs",
                path: "race.txt",
            })
            .unwrap();
        let listed: Vec<u64> = history.iter().map(|r| r.timestamp).collect();
        assert_eq!(listed, stamps);
        let latest = engine.files().get_latest("/docs", "race.txt").unwrap();
        assert_eq!(Some(&latest.latest_sync_timestamp), stamps.last());
        assert_eq!(latest.latest_hash, history[7].hash);
    }

    #[test]
    fn test_record_event_non_member() {
        let engine = engine();
        member(&engine, "/docs");
        let outsider = engine.clients().register_client("10.0.0.9:4000").unwrap();

        let err = engine
            .record_event(Observation::write(
                "/docs",
                "a.txt",
                outsider.uuid,
                "h1",
                VersionStamp::Next,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_download_by_version() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        let v1 = engine.put_content(b"first draft").unwrap();
        let v2 = engine.put_content(b"second draft").unwrap();
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, &v1, VersionStamp::Exact(1)))
            .unwrap();
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, &v2, VersionStamp::Exact(2)))
            .unwrap();

        assert_eq!(engine.download("/docs", "a.txt", 1).unwrap(), b"first draft");
        assert_eq!(engine.download("/docs", "a.txt", 2).unwrap(), b"second draft");
        assert!(engine.download("/docs", "a.txt", 3).unwrap_err().is_not_found());

        let dir = tempdir().unwrap();
        let target = dir.path().join("a.txt");
        assert_eq!(engine.download_to("/docs", "a.txt", 1, &target).unwrap(), 11);
        assert_eq!(std::fs::read(&target).unwrap(), b"first draft");
    }

    #[test]
    fn test_download_missing_blob_is_corrupted() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "deadbeef", VersionStamp::Exact(1)))
            .unwrap();

        assert!(matches!(
            engine.download("/docs", "a.txt", 1),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_verify_root() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(1)))
            .unwrap();
        engine
            .record_event(Observation::rename("/docs", "a.txt", "b.txt", c1, "h1", VersionStamp::Next))
            .unwrap();
        engine
            .record_event(Observation::delete("/docs", "b.txt", c1, "h1", VersionStamp::Next))
            .unwrap();
        assert_eq!(engine.verify_root("/docs").unwrap(), 2);

        // latest pointer drifting from history
        let mut file: File = engine.files().get_latest("/docs", "b.txt").unwrap();
        file.latest_hash = "h9".to_string();
        engine.store().put(&keys::file("/docs", "b.txt"), &file).unwrap();
        assert!(matches!(
            engine.verify_root("/docs"),
            Err(Error::Corrupted(_))
        ));

        assert!(engine.verify_root("/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_sweep_orphans() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(1)))
            .unwrap();

        // records of a root that no longer exists
        let orphan = File {
            root: "/gone".to_string(),
            path: "x.txt".to_string(),
            latest_hash: "h1".to_string(),
            latest_sync_timestamp: 1,
            exists: true,
            metadata: Default::default(),
        };
        engine.store().put(&keys::file("/gone", "x.txt"), &orphan).unwrap();
        engine.store().put(&keys::history("/gone", "x.txt", 1), &1u64).unwrap();
        // history of a live root whose file record is missing
        engine.store().put(&keys::history("/docs", "lost.txt", 1), &1u64).unwrap();

        let report = engine.sweep_orphans().unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.history, 2);
        assert_eq!(report.cascades, 2);

        let stats = engine.status().unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.history, 1);
        assert_eq!(stats.pending_sweeps, 0);
        assert_eq!(engine.sweep_orphans().unwrap(), SweepReport::default());
    }

    #[test]
    fn test_sweep_leaves_running_removal_alone() {
        let engine = engine();
        let c1 = member(&engine, "/docs");
        engine
            .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(1)))
            .unwrap();

        // remove_file has detached a.txt but not purged it yet
        engine.store().delete(&keys::file("/docs", "a.txt")).unwrap();
        let marker = SweepMarker {
            root: "/docs".to_string(),
            path: Some("a.txt".to_string()),
        };
        engine.store().put(&keys::sweep("/docs", Some("a.txt")), &marker).unwrap();

        assert_eq!(engine.sweep_orphans().unwrap(), SweepReport::default());
        let stats = engine.status().unwrap();
        assert_eq!(stats.pending_sweeps, 1);
        assert_eq!(stats.history, 1);

        // the path stays closed to new versions until its owner finishes
        let event = Observation::write("/docs", "a.txt", c1, "h2", VersionStamp::Next);
        assert!(matches!(
            engine.record_event(event),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn test_open_finishes_interrupted_cascade() {
        let dir = tempdir().unwrap();
        let mut config = Config::for_testing();
        config.storage.temporary = false;
        config.data_dir = dir.path().to_path_buf();

        {
            let engine = Engine::open(config.clone()).unwrap();
            let c1 = member(&engine, "/docs");
            engine
                .record_event(Observation::write("/docs", "a.txt", c1, "h1", VersionStamp::Exact(1)))
                .unwrap();
            // crash between detaching the root and purging it
            engine.store().delete(&keys::root("/docs")).unwrap();
            let marker = SweepMarker {
                root: "/docs".to_string(),
                path: None,
            };
            engine.store().put(&keys::sweep("/docs", None), &marker).unwrap();
            engine.flush().unwrap();
        }

        let engine = Engine::open(config).unwrap();
        let stats = engine.status().unwrap();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.history, 0);
        assert_eq!(stats.pending_sweeps, 0);
        engine.directories().register_root("/docs", "bob", "p2").unwrap();
    }
}
