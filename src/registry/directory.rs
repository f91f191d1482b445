//! Root directory registry
//!
//! Root lifecycle, password-gated membership and the cascading removal of
//! everything scoped under a root.

use crate::config::SecurityConfig;
use crate::error::{Error, Result};
use crate::registry::password::{generate_password, SecretHasher};
use crate::registry::Client;
use crate::store::{abort, keys, Store, SweepMarker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

/// A shared synchronization root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootDirectory {
    /// Canonical root key
    pub path: String,
    /// Owner identity
    pub owner: String,
    /// argon2 PHC string of the access password
    pub(crate) password_hash: String,
    /// Bumped on every password rotation
    pub credential_epoch: u64,
    /// Member client UUIDs
    pub members: BTreeSet<Uuid>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl RootDirectory {
    pub fn is_member(&self, uuid: &Uuid) -> bool {
        self.members.contains(uuid)
    }
}

/// Outcome of a cascading removal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// File records removed
    pub files: usize,
    /// History records removed (including rename index entries)
    pub history: usize,
}

/// Root directory records under the `d/` namespace
#[derive(Clone)]
pub struct DirectoryRegistry {
    store: Store,
    hasher: SecretHasher,
    default_password: Option<String>,
    generated_password_len: usize,
}

impl DirectoryRegistry {
    pub fn new(store: Store, security: &SecurityConfig) -> Result<Self> {
        Ok(DirectoryRegistry {
            store,
            hasher: SecretHasher::new(security)?,
            default_password: security.default_password.clone(),
            generated_password_len: security.generated_password_len,
        })
    }

    /// Register a new root. Fails with `AlreadyExists` if the key is taken.
    pub fn register_root(&self, path: &str, owner: &str, password: &str) -> Result<RootDirectory> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("root key must not be empty".to_string()));
        }
        let root = RootDirectory {
            path: path.to_string(),
            owner: owner.to_string(),
            password_hash: self.hasher.hash(password)?,
            credential_epoch: 0,
            members: BTreeSet::new(),
            created_at: Utc::now(),
        };

        let key = keys::root(path);
        let marker = keys::sweep(path, None);
        self.store.transaction(|tx| {
            if tx.contains(&key)? {
                return abort(Error::AlreadyExists(format!("root {}", path)));
            }
            // Records of a previous root with this key are still being purged
            if tx.contains(&marker)? {
                return abort(Error::Conflict {
                    key: path.to_string(),
                    latest: 0,
                });
            }
            tx.put(&key, &root)
        })?;

        info!("Registered root {} owned by {}", path, owner);
        Ok(root)
    }

    pub fn get_root(&self, path: &str) -> Result<RootDirectory> {
        self.store
            .get(&keys::root(path))?
            .ok_or_else(|| Error::NotFound(format!("root {}", path)))
    }

    /// All roots in key order
    pub fn list_roots(&self) -> Result<Vec<RootDirectory>> {
        Ok(self
            .store
            .scan_prefix::<RootDirectory>(keys::ROOT_PREFIX)?
            .into_iter()
            .map(|(_, root)| root)
            .collect())
    }

    pub fn list_members(&self, path: &str) -> Result<Vec<Uuid>> {
        Ok(self.get_root(path)?.members.into_iter().collect())
    }

    /// Fails with `Unauthorized` unless `client` is a member of `path`
    pub fn authorize(&self, path: &str, client: &Uuid) -> Result<RootDirectory> {
        let root = self.get_root(path)?;
        if !root.is_member(client) {
            return Err(Error::Unauthorized(format!(
                "client {} is not a member of {}",
                client, path
            )));
        }
        Ok(root)
    }

    /// Add `client` to the root's members after checking the password.
    /// Joining twice is a no-op.
    pub fn join_root(&self, path: &str, client: &Uuid, password: &str) -> Result<RootDirectory> {
        let snapshot = self.get_root(path)?;
        if !self.hasher.verify(password, &snapshot.password_hash)? {
            return Err(Error::Unauthorized(format!("wrong password for {}", path)));
        }

        let root_key = keys::root(path);
        let client_key = keys::client(client);
        let root = self.store.transaction(|tx| {
            let mut root: RootDirectory = match tx.get(&root_key)? {
                Some(root) => root,
                None => return abort(Error::NotFound(format!("root {}", path))),
            };
            // Rotated between the check above and this commit
            if root.password_hash != snapshot.password_hash {
                return abort(Error::Unauthorized(format!("password for {} changed", path)));
            }
            let mut member: Client = match tx.get(&client_key)? {
                Some(member) => member,
                None => return abort(Error::NotFound(format!("client {}", client))),
            };

            if root.members.insert(*client) {
                tx.put(&root_key, &root)?;
            }
            if member.roots.insert(path.to_string()) {
                tx.put(&client_key, &member)?;
            }
            Ok(root)
        })?;

        info!("Client {} joined root {}", client, path);
        Ok(root)
    }

    /// Replace the root password. Membership is untouched.
    pub fn set_password(&self, path: &str, password: &str) -> Result<u64> {
        let hash = self.hasher.hash(password)?;
        let key = keys::root(path);
        let epoch = self.store.transaction(|tx| {
            let mut root: RootDirectory = match tx.get(&key)? {
                Some(root) => root,
                None => return abort(Error::NotFound(format!("root {}", path))),
            };
            root.password_hash = hash.clone();
            root.credential_epoch += 1;
            tx.put(&key, &root)?;
            Ok(root.credential_epoch)
        })?;

        info!("Password for root {} rotated (epoch {})", path, epoch);
        Ok(epoch)
    }

    /// Restore the configured default password, or generate a fresh one.
    /// Returns the new secret.
    pub fn reset_password(&self, path: &str) -> Result<Zeroizing<String>> {
        let secret = match &self.default_password {
            Some(default) => Zeroizing::new(default.clone()),
            None => generate_password(self.generated_password_len),
        };
        self.set_password(path, &secret)?;
        Ok(secret)
    }

    /// Delete a root and every file and history record scoped under it.
    ///
    /// The root record disappears in one transaction that also drops it from
    /// every member's client record and leaves a sweep marker. File and
    /// history records are then purged in batches and the marker removed.
    /// Readers treat records whose root is missing as absent, so the purge
    /// is never observable; an interrupted purge is finished by the next
    /// sweep.
    pub fn remove_root(&self, path: &str) -> Result<CascadeReport> {
        let root_key = keys::root(path);
        let marker_key = keys::sweep(path, None);
        let marker = SweepMarker {
            root: path.to_string(),
            path: None,
        };

        self.store.transaction(|tx| {
            let root: RootDirectory = match tx.get(&root_key)? {
                Some(root) => root,
                None => return abort(Error::NotFound(format!("root {}", path))),
            };
            for uuid in &root.members {
                let client_key = keys::client(uuid);
                if let Some(mut member) = tx.get::<Client>(&client_key)? {
                    if member.roots.remove(path) {
                        tx.put(&client_key, &member)?;
                    }
                }
            }
            tx.delete(&root_key)?;
            tx.put(&marker_key, &marker)
        })?;
        debug!("Root {} detached, purging", path);

        let report = purge_root(&self.store, path)?;
        info!(
            "Removed root {} ({} files, {} history records)",
            path, report.files, report.history
        );
        Ok(report)
    }

    /// Remove every root. Stops at the first failure; roots removed so far
    /// stay removed and every remaining root is untouched.
    pub fn remove_all_roots(&self) -> Result<usize> {
        let mut removed = 0;
        for root in self.list_roots()? {
            match self.remove_root(&root.path) {
                Ok(_) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// Purge file and history records of a detached root, then clear its marker
pub(crate) fn purge_root(store: &Store, path: &str) -> Result<CascadeReport> {
    let files = store.purge_prefix(&keys::file_root_prefix(path))?;
    let history = store.purge_prefix(&keys::history_root_prefix(path))?;
    store.delete(&keys::sweep(path, None))?;
    Ok(CascadeReport { files, history })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ClientRegistry;

    fn setup() -> (Store, ClientRegistry, DirectoryRegistry) {
        let store = Store::in_memory().unwrap();
        let config = Config::for_testing();
        let clients = ClientRegistry::new(store.clone());
        let dirs = DirectoryRegistry::new(store.clone(), &config.security).unwrap();
        (store, clients, dirs)
    }

    #[test]
    fn test_register_root() {
        let (_, _, dirs) = setup();
        let root = dirs.register_root("/docs", "alice", "p1").unwrap();

        assert_eq!(root.owner, "alice");
        assert_ne!(root.password_hash, "p1");
        assert_eq!(dirs.get_root("/docs").unwrap(), root);
        assert!(matches!(
            dirs.register_root("/docs", "bob", "p2"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_join_requires_password() {
        let (_, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();

        assert!(matches!(
            dirs.join_root("/docs", &c1.uuid, "wrong"),
            Err(Error::Unauthorized(_))
        ));
        assert!(dirs.list_members("/docs").unwrap().is_empty());

        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();
        assert_eq!(dirs.list_members("/docs").unwrap(), vec![c1.uuid]);
        assert!(clients.get_client(&c1.uuid).unwrap().roots.contains("/docs"));
    }

    #[test]
    fn test_join_is_idempotent() {
        let (_, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();

        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();
        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();
        assert_eq!(dirs.list_members("/docs").unwrap().len(), 1);
    }

    #[test]
    fn test_join_unknown_root_or_client() {
        let (_, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        assert!(dirs.join_root("/nope", &c1.uuid, "p1").unwrap_err().is_not_found());

        dirs.register_root("/docs", "alice", "p1").unwrap();
        assert!(dirs
            .join_root("/docs", &Uuid::new_v4(), "p1")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_set_password_keeps_membership() {
        let (_, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        let c2 = clients.register_client("10.0.0.2:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();
        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();

        assert_eq!(dirs.set_password("/docs", "p2").unwrap(), 1);

        assert!(matches!(
            dirs.join_root("/docs", &c2.uuid, "p1"),
            Err(Error::Unauthorized(_))
        ));
        dirs.join_root("/docs", &c2.uuid, "p2").unwrap();

        let members = dirs.list_members("/docs").unwrap();
        assert!(members.contains(&c1.uuid));
        assert!(members.contains(&c2.uuid));
    }

    #[test]
    fn test_reset_password_generates_secret() {
        let (_, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();

        let secret = dirs.reset_password("/docs").unwrap();
        assert_eq!(secret.len(), Config::for_testing().security.generated_password_len);
        assert!(dirs.join_root("/docs", &c1.uuid, "p1").is_err());
        dirs.join_root("/docs", &c1.uuid, &secret).unwrap();
        assert_eq!(dirs.get_root("/docs").unwrap().credential_epoch, 1);
    }

    #[test]
    fn test_reset_password_restores_default() {
        let store = Store::in_memory().unwrap();
        let mut config = Config::for_testing();
        config.security.default_password = Some("factory".to_string());
        let dirs = DirectoryRegistry::new(store, &config.security).unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();

        let secret = dirs.reset_password("/docs").unwrap();
        assert_eq!(secret.as_str(), "factory");
    }

    #[test]
    fn test_password_ops_on_unknown_root() {
        let (_, _, dirs) = setup();
        assert!(dirs.set_password("/nope", "x").unwrap_err().is_not_found());
        assert!(dirs.reset_password("/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_root_cascades() {
        let (store, clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();
        dirs.register_root("/docs2", "bob", "p1").unwrap();
        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();

        store.put(&keys::file("/docs", "a.txt"), &1u64).unwrap();
        store.put(&keys::history("/docs", "a.txt", 1), &1u64).unwrap();
        store.put(&keys::file("/docs2", "b.txt"), &2u64).unwrap();

        let report = dirs.remove_root("/docs").unwrap();
        assert_eq!(report, CascadeReport { files: 1, history: 1 });

        assert!(dirs.get_root("/docs").unwrap_err().is_not_found());
        assert!(!store.contains(&keys::file("/docs", "a.txt")).unwrap());
        assert!(store.contains(&keys::file("/docs2", "b.txt")).unwrap());
        assert!(!store.contains(&keys::sweep("/docs", None)).unwrap());
        assert!(clients.get_client(&c1.uuid).unwrap().roots.is_empty());

        assert!(dirs.remove_root("/docs").unwrap_err().is_not_found());
    }

    #[test]
    fn test_register_blocked_while_sweep_pending() {
        let (store, _, dirs) = setup();
        let marker = SweepMarker {
            root: "/docs".to_string(),
            path: None,
        };
        store.put(&keys::sweep("/docs", None), &marker).unwrap();

        let err = dirs.register_root("/docs", "alice", "p1").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_remove_all_roots() {
        let (_, _, dirs) = setup();
        for name in ["/a", "/b", "/c"] {
            dirs.register_root(name, "alice", "p1").unwrap();
        }
        assert_eq!(dirs.remove_all_roots().unwrap(), 3);
        assert!(dirs.list_roots().unwrap().is_empty());
    }
}
