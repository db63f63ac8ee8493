//! Metadata repository over the coordination store
//!
//! Stores:
//! - Share records (`shares/<name>`)
//! - Backend allocation metadata (`backends/<backend>`)
//!
//! Share records are only written while the share's lock is held. Backend
//! metadata is shared by unrelated shares and is updated with a
//! compare-and-swap loop instead.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::common::{encode_key, Error, KVStore, Result};

pub const SHARE_PREFIX: &str = "shares/";
pub const BACKEND_PREFIX: &str = "backends/";

/// Upper bound on compare-and-swap attempts for one backend update
const MAX_CAS_ATTEMPTS: usize = 64;

pub fn share_key(name: &str) -> String {
    format!("{}{}", SHARE_PREFIX, encode_key(name))
}

pub fn backend_key(backend: &str) -> String {
    format!("{}{}", BACKEND_PREFIX, encode_key(backend))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::MetadataCorrupted(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Nfs,
    Smb,
}

impl Protocol {
    /// Filesystem type passed to `mount -t`
    pub fn mount_type(&self) -> &'static str {
        match self {
            Protocol::Nfs => "nfs",
            Protocol::Smb => "cifs",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Nfs => write!(f, "nfs"),
            Protocol::Smb => write!(f, "smb"),
        }
    }
}

/// Canonical record of a provisioned share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub id: String,
    pub name: String,
    pub backend: String,
    pub pool: String,
    pub fpg: String,
    pub vfs: String,
    pub fstore: String,
    pub vfs_ips: Vec<String>,
    /// Identifier the array assigned to the share
    pub backend_share_id: String,
    pub protocol: Protocol,
    pub share_dir: Option<String>,
    pub readonly: bool,
    pub protocol_opts: Option<String>,
    pub size_gib: u64,
    pub soft_quota_gib: u64,
    pub hard_quota_gib: u64,
    pub allow_ips: Vec<String>,
    pub deny_ips: Vec<String>,
    pub comment: String,
    pub snapshots: Vec<String>,
    /// Node addresses currently granted access at the array
    pub client_ips: BTreeSet<String>,
    /// node id -> (mount id -> local mount directory)
    pub mount_state: BTreeMap<String, BTreeMap<String, PathBuf>>,
    pub created_at: DateTime<Utc>,
}

impl ShareRecord {
    /// Export path as seen by clients. NFS: `<vfs_ip>:/<fpg>/<vfs>/<fstore>[/<dir>]`,
    /// SMB: `//<vfs_ip>/<fstore>[/<dir>]`.
    pub fn export_path(&self) -> Result<String> {
        let vfs_ip = self.vfs_ips.first().ok_or_else(|| {
            Error::MetadataCorrupted(format!("share {} has no VFS address", self.name))
        })?;

        let mut path = match self.protocol {
            Protocol::Nfs => format!("{}:/{}/{}/{}", vfs_ip, self.fpg, self.vfs, self.fstore),
            Protocol::Smb => format!("//{}/{}", vfs_ip, self.fstore),
        };
        if let Some(dir) = &self.share_dir {
            path.push('/');
            path.push_str(dir.trim_start_matches('/'));
        }
        Ok(path)
    }

    /// Mounts recorded for one node
    pub fn mounts_on(&self, node_id: &str) -> Option<&BTreeMap<String, PathBuf>> {
        self.mount_state.get(node_id)
    }

    /// Is the share mounted on any node?
    pub fn is_mounted(&self) -> bool {
        self.mount_state.values().any(|mounts| !mounts.is_empty())
    }
}

/// Allocation state of one container (FPG/VFS pair) on a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAlloc {
    pub pool: String,
    pub vfs: String,
    pub vfs_ips: Vec<String>,
    /// Shares placed on the container, including in-flight reservations
    pub share_count: usize,
}

/// Per-backend allocation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub backend: String,
    /// Source of generated container names; only ever increases
    pub counter: u64,
    /// pool -> current default container
    pub default_containers: BTreeMap<String, Option<String>>,
    /// fpg -> allocation state
    pub containers: BTreeMap<String, ContainerAlloc>,
    /// Client address -> number of shares granting it access
    pub client_grants: BTreeMap<String, u32>,
    /// Bumped on every write
    pub revision: u64,
}

impl BackendMetadata {
    pub fn new(backend: &str, default_pool: Option<&str>) -> Self {
        let mut default_containers = BTreeMap::new();
        if let Some(pool) = default_pool {
            default_containers.insert(pool.to_string(), None);
        }
        Self {
            backend: backend.to_string(),
            counter: 0,
            default_containers,
            containers: BTreeMap::new(),
            client_grants: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn default_container(&self, pool: &str) -> Option<&str> {
        self.default_containers
            .get(pool)
            .and_then(|fpg| fpg.as_deref())
    }

    /// Record one more share granting `ip`
    pub fn grant_client(&mut self, ip: &str) {
        *self.client_grants.entry(ip.to_string()).or_insert(0) += 1;
    }

    /// Drop one grant of `ip`; the address disappears with its last grant
    pub fn revoke_client(&mut self, ip: &str) {
        if let Some(count) = self.client_grants.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.client_grants.remove(ip);
            }
        }
    }
}

/// Metadata repository
pub struct MetadataRepository {
    store: Arc<dyn KVStore>,
}

impl MetadataRepository {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KVStore> {
        &self.store
    }

    // === Share operations ===

    pub fn get_share(&self, name: &str) -> Result<Option<ShareRecord>> {
        match self.store.get(&share_key(name))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a share or fail with `NotFound`
    pub fn require_share(&self, name: &str) -> Result<ShareRecord> {
        self.get_share(name)?
            .ok_or_else(|| Error::NotFound(format!("share {}", name)))
    }

    /// Persist a new share; fails with `AlreadyExists` if the key is taken
    pub fn insert_share(&self, record: &ShareRecord) -> Result<()> {
        if self
            .store
            .put_if_absent(&share_key(&record.name), encode(record)?)?
        {
            Ok(())
        } else {
            Err(Error::AlreadyExists(format!("share {}", record.name)))
        }
    }

    pub fn save_share(&self, record: &ShareRecord) -> Result<()> {
        self.store.put(&share_key(&record.name), encode(record)?)
    }

    /// Read-modify-write of one share. Callers hold the share's lock.
    pub fn update_share<F>(&self, name: &str, mutate: F) -> Result<ShareRecord>
    where
        F: FnOnce(&mut ShareRecord) -> Result<()>,
    {
        let mut record = self.require_share(name)?;
        mutate(&mut record)?;
        self.save_share(&record)?;
        Ok(record)
    }

    pub fn delete_share(&self, name: &str) -> Result<()> {
        self.store.delete(&share_key(name))
    }

    pub fn list_shares(&self) -> Result<Vec<ShareRecord>> {
        self.store
            .list_prefix(SHARE_PREFIX)?
            .iter()
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    // === Backend operations ===

    pub fn get_backend(&self, backend: &str) -> Result<Option<BackendMetadata>> {
        match self.store.get(&backend_key(backend))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create the backend's metadata if no node has done so yet
    pub fn init_backend(&self, backend: &str, default_pool: Option<&str>) -> Result<BackendMetadata> {
        let fresh = BackendMetadata::new(backend, default_pool);
        if self.store.put_if_absent(&backend_key(backend), encode(&fresh)?)? {
            tracing::info!("Initialized allocation metadata for backend {}", backend);
            return Ok(fresh);
        }
        self.get_backend(backend)?
            .ok_or_else(|| Error::Store(format!("backend {} vanished during init", backend)))
    }

    /// Atomically apply `mutate` to the backend's metadata.
    ///
    /// The closure may run several times under contention and must derive
    /// its result from the metadata it is given. An error from the closure
    /// aborts the update without writing.
    pub fn update_backend<T, F>(&self, backend: &str, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut BackendMetadata) -> Result<T>,
    {
        let key = backend_key(backend);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&key)?;
            let mut meta = match &current {
                Some(bytes) => decode::<BackendMetadata>(bytes)?,
                None => BackendMetadata::new(backend, None),
            };

            let result = mutate(&mut meta)?;
            meta.revision += 1;

            if self
                .store
                .compare_and_swap(&key, current.as_deref(), Some(encode(&meta)?))?
            {
                return Ok(result);
            }
            tracing::debug!("Backend {} metadata changed concurrently, retrying", backend);
        }

        Err(Error::Store(format!(
            "backend {} metadata update lost {} races",
            backend, MAX_CAS_ATTEMPTS
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::MemStore;

    pub(crate) fn sample_share(name: &str) -> ShareRecord {
        ShareRecord {
            id: "3f1c9a7e".to_string(),
            name: name.to_string(),
            backend: "DEFAULT".to_string(),
            pool: "cpg_a".to_string(),
            fpg: "fpg_cpg_a_1".to_string(),
            vfs: "vfs_cpg_a_1".to_string(),
            fstore: name.to_string(),
            vfs_ips: vec!["10.50.3.21".to_string()],
            backend_share_id: "share-1".to_string(),
            protocol: Protocol::Nfs,
            share_dir: None,
            readonly: false,
            protocol_opts: None,
            size_gib: 10,
            soft_quota_gib: 0,
            hard_quota_gib: 10,
            allow_ips: vec![],
            deny_ips: vec![],
            comment: String::new(),
            snapshots: vec![],
            client_ips: BTreeSet::new(),
            mount_state: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    fn repo() -> MetadataRepository {
        MetadataRepository::new(Arc::new(MemStore::new()))
    }

    #[test]
    fn test_share_lifecycle() {
        let repo = repo();
        let share = sample_share("alpha");

        repo.insert_share(&share).unwrap();
        assert!(matches!(
            repo.insert_share(&share),
            Err(Error::AlreadyExists(_))
        ));

        let loaded = repo.require_share("alpha").unwrap();
        assert_eq!(loaded, share);

        let updated = repo
            .update_share("alpha", |r| {
                r.comment = "scratch space".into();
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.comment, "scratch space");
        assert_eq!(repo.list_shares().unwrap().len(), 1);

        repo.delete_share("alpha").unwrap();
        assert!(repo.get_share("alpha").unwrap().is_none());
        assert!(matches!(repo.require_share("alpha"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_export_path() {
        let mut share = sample_share("alpha");
        assert_eq!(
            share.export_path().unwrap(),
            "10.50.3.21:/fpg_cpg_a_1/vfs_cpg_a_1/alpha"
        );

        share.share_dir = Some("/data".into());
        assert_eq!(
            share.export_path().unwrap(),
            "10.50.3.21:/fpg_cpg_a_1/vfs_cpg_a_1/alpha/data"
        );

        share.protocol = Protocol::Smb;
        assert_eq!(share.export_path().unwrap(), "//10.50.3.21/alpha/data");

        share.vfs_ips.clear();
        assert!(share.export_path().is_err());
    }

    #[test]
    fn test_init_backend_is_idempotent() {
        let repo = repo();
        let first = repo.init_backend("DEFAULT", Some("cpg_a")).unwrap();
        assert_eq!(first.default_containers.get("cpg_a"), Some(&None));

        repo.update_backend("DEFAULT", |m| {
            m.counter = 7;
            Ok(())
        })
        .unwrap();

        let again = repo.init_backend("DEFAULT", Some("cpg_b")).unwrap();
        assert_eq!(again.counter, 7);
        assert!(!again.default_containers.contains_key("cpg_b"));
    }

    #[test]
    fn test_update_backend_error_does_not_write() {
        let repo = repo();
        repo.init_backend("DEFAULT", None).unwrap();

        let result: Result<()> = repo.update_backend("DEFAULT", |m| {
            m.counter = 99;
            Err(Error::InvalidPlacement("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(repo.get_backend("DEFAULT").unwrap().unwrap().counter, 0);
    }

    #[test]
    fn test_client_grants_refcount() {
        let mut meta = BackendMetadata::new("DEFAULT", None);
        meta.grant_client("10.0.0.5");
        meta.grant_client("10.0.0.5");
        meta.revoke_client("10.0.0.5");
        assert_eq!(meta.client_grants.get("10.0.0.5"), Some(&1));
        meta.revoke_client("10.0.0.5");
        assert!(meta.client_grants.is_empty());
    }
}
