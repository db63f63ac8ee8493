//! Coordination store abstraction
//!
//! Every node reads and writes shared state through [`KVStore`]. Besides plain
//! get/put/delete/list it offers the two conditional writes the engine relies
//! on for cross-node correctness: create-if-absent and compare-and-swap.
//!
//! Backends: in-memory (tests, single process), RocksDB (single host) and
//! sled (feature `sled-backend`). A cluster-wide deployment implements the
//! trait over its coordination service.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rocksdb::{Direction, IteratorMode, Options, DB};

use super::config::{StoreConfig, StoreKind};
use super::{Error, Result};

/// Trait for key-value coordination store backends
pub trait KVStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Write `value` only if `key` is absent. Returns whether it was written.
    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` = absent). `new = None` deletes. Returns whether it swapped.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool>;
}

fn poisoned<T>(_: T) -> Error {
    Error::Store("store mutex poisoned".into())
}

/// In-memory store
pub struct MemStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().map_err(poisoned)?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.map
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.lock().map_err(poisoned)?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut map = self.map.lock().map_err(poisoned)?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), value);
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut map = self.map.lock().map_err(poisoned)?;
        if map.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                map.insert(key.to_string(), value);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }
}

/// RocksDB store. Conditional writes are serialized by a process-local mutex,
/// so the guarantees hold for every handle sharing one `RocksStore`.
pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KVStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value) = item?;
            if !key_bytes.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| Error::MetadataCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        if self.db.get(key.as_bytes())?.is_some() {
            return Ok(false);
        }
        self.db.put(key.as_bytes(), value)?;
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().map_err(poisoned)?;
        let current = self.db.get(key.as_bytes())?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.db.put(key.as_bytes(), value)?,
            None => self.db.delete(key.as_bytes())?,
        }
        Ok(true)
    }
}

/// Sled store
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

#[cfg(feature = "sled-backend")]
impl KVStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| Error::MetadataCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        self.compare_and_swap(key, None, Some(value))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        Ok(self.db.compare_and_swap(key, expected, new)?.is_ok())
    }
}

/// Open the store selected by configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KVStore>> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemStore::new())),
        StoreKind::Rocksdb => Ok(Arc::new(RocksStore::open(&config.path)?)),
        #[cfg(feature = "sled-backend")]
        StoreKind::Sled => Ok(Arc::new(SledStore::open(&config.path)?)),
        #[cfg(not(feature = "sled-backend"))]
        StoreKind::Sled => Err(Error::InvalidConfig(
            "sled store requested but the sled-backend feature is disabled".into(),
        )),
    }
}
