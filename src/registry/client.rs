//! Client registry
//!
//! Tracks every synchronizing endpoint and the roots it belongs to.

use crate::error::{Error, Result};
use crate::registry::RootDirectory;
use crate::store::{abort, keys, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registered synchronizing endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    /// Unique client ID
    pub uuid: Uuid,
    /// Locally assigned ordinal
    pub id: u64,
    /// Network address the client registered from
    pub address: String,
    /// Root keys this client has joined
    pub roots: BTreeSet<String>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

/// Client records under the `c/` namespace
#[derive(Clone)]
pub struct ClientRegistry {
    store: Store,
}

impl ClientRegistry {
    pub fn new(store: Store) -> Self {
        ClientRegistry { store }
    }

    /// Allocate a UUID and ordinal for a new client
    pub fn register_client(&self, address: &str) -> Result<Client> {
        let client = Client {
            uuid: Uuid::new_v4(),
            id: self.store.generate_id()? + 1,
            address: address.to_string(),
            roots: BTreeSet::new(),
            registered_at: Utc::now(),
        };
        self.store.put(&keys::client(&client.uuid), &client)?;

        info!(
            "Registered client {} (#{}) from {}",
            client.uuid, client.id, client.address
        );
        Ok(client)
    }

    pub fn get_client(&self, uuid: &Uuid) -> Result<Client> {
        self.store
            .get(&keys::client(uuid))?
            .ok_or_else(|| Error::NotFound(format!("client {}", uuid)))
    }

    /// All clients in key order
    pub fn list_clients(&self) -> Result<Vec<Client>> {
        Ok(self
            .store
            .scan_prefix::<Client>(keys::CLIENT_PREFIX)?
            .into_iter()
            .map(|(_, client)| client)
            .collect())
    }

    /// Delete a client and drop it from every root it joined.
    ///
    /// The client record goes first; each membership is then removed in its
    /// own transaction. A failing membership update is logged and skipped.
    pub fn remove_client(&self, uuid: &Uuid) -> Result<Client> {
        let key = keys::client(uuid);
        let client: Client = self.store.transaction(|tx| {
            let client: Option<Client> = tx.get(&key)?;
            match client {
                Some(client) => {
                    tx.delete(&key)?;
                    Ok(client)
                }
                None => abort(Error::NotFound(format!("client {}", uuid))),
            }
        })?;

        for root in &client.roots {
            if let Err(e) = self.drop_membership(root, uuid) {
                warn!("Failed to drop client {} from root {}: {}", uuid, root, e);
            }
        }

        info!("Removed client {} (#{})", client.uuid, client.id);
        Ok(client)
    }

    /// Remove every client. Returns how many were removed.
    pub fn remove_all_clients(&self) -> Result<usize> {
        let mut removed = 0;
        for client in self.list_clients()? {
            match self.remove_client(&client.uuid) {
                Ok(_) => removed += 1,
                // Raced with another removal
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    fn drop_membership(&self, root: &str, uuid: &Uuid) -> Result<()> {
        let key = keys::root(root);
        self.store.transaction(|tx| {
            if let Some(mut dir) = tx.get::<RootDirectory>(&key)? {
                if dir.members.remove(uuid) {
                    tx.put(&key, &dir)?;
                }
            }
            Ok(())
        })?;
        debug!("Dropped client {} from root {}", uuid, root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::DirectoryRegistry;

    fn setup() -> (ClientRegistry, DirectoryRegistry) {
        let store = Store::in_memory().unwrap();
        let config = Config::for_testing();
        (
            ClientRegistry::new(store.clone()),
            DirectoryRegistry::new(store, &config.security).unwrap(),
        )
    }

    #[test]
    fn test_register_and_get() {
        let (clients, _) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        let c2 = clients.register_client("10.0.0.2:4000").unwrap();

        assert_ne!(c1.uuid, c2.uuid);
        assert!(c2.id > c1.id);
        assert_eq!(clients.get_client(&c1.uuid).unwrap(), c1);
        assert_eq!(clients.list_clients().unwrap().len(), 2);
    }

    #[test]
    fn test_get_unknown_client() {
        let (clients, _) = setup();
        let err = clients.get_client(&Uuid::new_v4()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_client_drops_membership() {
        let (clients, dirs) = setup();
        let c1 = clients.register_client("10.0.0.1:4000").unwrap();
        let c2 = clients.register_client("10.0.0.2:4000").unwrap();
        dirs.register_root("/docs", "alice", "p1").unwrap();
        dirs.join_root("/docs", &c1.uuid, "p1").unwrap();
        dirs.join_root("/docs", &c2.uuid, "p1").unwrap();

        clients.remove_client(&c1.uuid).unwrap();

        assert!(clients.get_client(&c1.uuid).unwrap_err().is_not_found());
        let members = dirs.list_members("/docs").unwrap();
        assert_eq!(members, vec![c2.uuid]);
    }

    #[test]
    fn test_remove_unknown_client() {
        let (clients, _) = setup();
        assert!(clients.remove_client(&Uuid::new_v4()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_all_clients() {
        let (clients, _) = setup();
        for i in 0..3 {
            clients.register_client(&format!("10.0.0.{}:4000", i)).unwrap();
        }
        assert_eq!(clients.remove_all_clients().unwrap(), 3);
        assert!(clients.list_clients().unwrap().is_empty());
    }
}
