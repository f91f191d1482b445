//! Content-addressed blob storage
//!
//! History records carry only a content hash; the bytes behind a hash live
//! here so a past version can be downloaded. Blobs are compressed with LZ4
//! and identical content is stored once.

use crate::error::{Error, Result};
use crate::store::Store;
use sled::Tree;
use tracing::debug;

/// Storage for file contents keyed by their hash
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its hash
    fn put(&self, data: &[u8]) -> Result<String>;

    /// Fetch the content for `hash`, if present
    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    fn contains(&self, hash: &str) -> Result<bool>;

    /// Drop the content for `hash`. Returns whether anything was removed.
    fn remove(&self, hash: &str) -> Result<bool>;
}

/// Hex BLAKE3 digest used as the content hash
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Blob store on the `blobs` tree of the database
#[derive(Clone)]
pub struct BlobStore {
    tree: Tree,
}

impl BlobStore {
    pub fn new(store: &Store) -> Self {
        BlobStore {
            tree: store.blob_tree().clone(),
        }
    }
}

impl ContentStore for BlobStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let hash = content_hash(data);
        if self.tree.contains_key(hash.as_bytes())? {
            debug!("Blob {} already stored", hash);
            return Ok(hash);
        }

        let compressed = lz4_flex::compress_prepend_size(data);
        debug!(
            "Storing blob {} ({} -> {} bytes)",
            hash,
            data.len(),
            compressed.len()
        );
        self.tree.insert(hash.as_bytes(), compressed)?;
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.tree.get(hash.as_bytes())? else {
            return Ok(None);
        };
        let data = lz4_flex::decompress_size_prepended(&stored)
            .map_err(|e| Error::Corrupted(format!("blob {}: {}", hash, e)))?;
        if content_hash(&data) != hash {
            return Err(Error::Corrupted(format!("blob {} fails its hash check", hash)));
        }
        Ok(Some(data))
    }

    fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.tree.contains_key(hash.as_bytes())?)
    }

    fn remove(&self, hash: &str) -> Result<bool> {
        Ok(self.tree.remove(hash.as_bytes())?.is_some())
    }
}
