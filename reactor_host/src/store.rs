//! Collection-scoped JSON document store backing every resource cache.
//!
//! Backends deal in raw bytes; [`Database`] owns the JSON encoding so that
//! unserializable documents are rejected at `set` and corrupt rows read back
//! as absent.

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::StoreError;

/// Byte-level storage with per-row atomicity.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    fn put(&self, collection: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    fn fetch(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError>;
    /// All rows of a collection ordered by key.
    fn scan(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    /// Names of collections holding at least one row, ordered by name.
    fn collections(&self) -> Result<Vec<String>, StoreError>;
    fn clear(&self, collection: &str) -> Result<usize, StoreError>;
}

/// Persistent backend: one sled tree per collection.
#[derive(Debug, Clone)]
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        info!("Database opened at '{}'", path.display());
        Ok(Self { db })
    }

    /// Throwaway database that is removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledBackend {
    fn put(&self, collection: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let tree = self.db.open_tree(collection)?;
        tree.insert(key.as_bytes(), bytes)?;
        tree.flush()?;
        Ok(())
    }

    fn fetch(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.db.open_tree(collection)?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        let tree = self.db.open_tree(collection)?;
        let removed = tree.remove(key.as_bytes())?.is_some();
        tree.flush()?;
        Ok(removed)
    }

    fn scan(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let tree = self.db.open_tree(collection)?;
        let mut rows = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            rows.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(rows)
    }

    fn collections(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for raw in self.db.tree_names() {
            let name = String::from_utf8_lossy(&raw).into_owned();
            if name.starts_with("__sled__") {
                continue;
            }
            if !self.db.open_tree(&raw)?.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn clear(&self, collection: &str) -> Result<usize, StoreError> {
        let tree = self.db.open_tree(collection)?;
        let count = tree.len();
        tree.clear()?;
        tree.flush()?;
        Ok(count)
    }
}

/// Process-local backend for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, collection: &str, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), bytes);
        Ok(())
    }

    fn fetch(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .write()
            .get_mut(collection)
            .map(|rows| rows.remove(key).is_some())
            .unwrap_or(false))
    }

    fn scan(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .collections
            .read()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn clear(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self
            .collections
            .write()
            .remove(collection)
            .map(|rows| rows.len())
            .unwrap_or(0))
    }
}

/// JSON document store shared by the resource managers and plugins.
#[derive(Debug, Clone)]
pub struct Database {
    backend: Arc<dyn StorageBackend>,
}

impl Database {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SledBackend::open(path)?)))
    }

    /// Store or replace a document. Documents that cannot be encoded as JSON
    /// are rejected before anything is written.
    #[instrument(skip(self, document))]
    pub fn set<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        key: &str,
        document: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(document).map_err(|source| StoreError::NotSerializable {
            collection: collection.to_string(),
            key: key.to_string(),
            source,
        })?;
        self.backend.put(collection, key, bytes)
    }

    /// Fetch a document; a row that no longer decodes is reported as absent.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let Some(bytes) = self.backend.fetch(collection, key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    "Failed to deserialize data for collection '{}', key '{}': {}. Returning None.",
                    collection, key, e
                );
                Ok(None)
            }
        }
    }

    /// Typed fetch; documents that do not match `T` are treated like corrupt rows.
    pub fn get_as<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>, StoreError> {
        let Some(value) = self.get(collection, key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                warn!(
                    "Document in collection '{}', key '{}' has an unexpected shape: {}",
                    collection, key, e
                );
                Ok(None)
            }
        }
    }

    pub fn remove(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        self.backend.delete(collection, key)
    }

    pub fn list_keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.backend.scan(collection)?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.backend.collections()
    }

    /// Every decodable document in a collection; corrupt rows are skipped.
    pub fn get_all(&self, collection: &str) -> Result<HashMap<String, Value>, StoreError> {
        let mut documents = HashMap::new();
        for (key, bytes) in self.backend.scan(collection)? {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    documents.insert(key, value);
                }
                Err(e) => warn!(
                    "Failed to deserialize data for collection '{}', key '{}': {}. Skipping.",
                    collection, key, e
                ),
            }
        }
        Ok(documents)
    }

    pub fn clear_collection(&self, collection: &str) -> Result<usize, StoreError> {
        self.backend.clear(collection)
    }

    /// Write raw bytes, bypassing encoding. Used to exercise corrupt-row handling.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, collection: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.backend.put(collection, key, bytes.to_vec())
    }
}
