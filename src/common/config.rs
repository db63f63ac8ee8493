//! Configuration for shareplane nodes
//!
//! Loaded from an optional TOML file, then `SHAREPLANE_*` environment
//! variables (nested keys separated by `__`, e.g. `SHAREPLANE_LOCK__TTL_MS`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Error, Result};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier within the cluster)
    pub node_id: String,

    /// Address granted access at the array when this node mounts a share
    pub node_ip: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Coordination store
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-share lock tuning
    #[serde(default)]
    pub lock: LockConfig,

    /// Local directory under which shares are mounted
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Concurrent background creations per process
    #[serde(default = "default_max_background_creates")]
    pub max_background_creates: usize,

    /// Configured arrays
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_mount_root() -> PathBuf {
    PathBuf::from("/opt/shareplane/mounts")
}
fn default_max_background_creates() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Rocksdb,
    Sled,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./shareplane-data")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

/// Lock lease and wait settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease on a lock record; an expired lease may be taken over. The
    /// holder renews it every third of the lease while it works.
    #[serde(default = "default_lock_ttl")]
    pub ttl_ms: u64,

    /// Bounded wait before `LockTimeout`
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Delay between acquisition attempts
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_lock_ttl() -> u64 {
    300_000
}
fn default_acquire_timeout() -> u64 {
    30_000
}
fn default_poll_interval() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl(),
            acquire_timeout_ms: default_acquire_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How often a holder extends its lease
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_ms / 3).max(1))
    }
}

/// One storage array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name as used in requests
    pub name: String,

    /// Pool used when a request names neither pool nor container
    #[serde(default)]
    pub default_pool: Option<String>,

    /// Maximum shares hosted by one container
    #[serde(default = "default_max_shares")]
    pub max_shares_per_container: usize,

    #[serde(default = "default_fpg_prefix")]
    pub fpg_prefix: String,

    #[serde(default = "default_vfs_prefix")]
    pub vfs_prefix: String,

    /// Share size when the request has none
    #[serde(default = "default_size_gib")]
    pub default_size_gib: u64,

    /// Size of containers created by the planner
    #[serde(default = "default_container_size_gib")]
    pub container_size_gib: u64,

    #[serde(default = "default_array_call_timeout")]
    pub array_call_timeout_ms: u64,

    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,
}

fn default_max_shares() -> usize {
    16
}
fn default_fpg_prefix() -> String {
    "fpg".to_string()
}
fn default_vfs_prefix() -> String {
    "vfs".to_string()
}
fn default_size_gib() -> u64 {
    1024
}
fn default_container_size_gib() -> u64 {
    16 * 1024
}
fn default_array_call_timeout() -> u64 {
    120_000
}
fn default_setup_timeout() -> u64 {
    30_000
}

pub const DEFAULT_BACKEND: &str = "DEFAULT";

impl BackendConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_pool: None,
            max_shares_per_container: default_max_shares(),
            fpg_prefix: default_fpg_prefix(),
            vfs_prefix: default_vfs_prefix(),
            default_size_gib: default_size_gib(),
            container_size_gib: default_container_size_gib(),
            array_call_timeout_ms: default_array_call_timeout(),
            setup_timeout_ms: default_setup_timeout(),
        }
    }

    pub fn array_call_timeout(&self) -> Duration {
        Duration::from_millis(self.array_call_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

impl Config {
    /// Minimal configuration for one node with one backend named `DEFAULT`
    pub fn for_node(node_id: impl Into<String>, node_ip: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_ip: node_ip.into(),
            log_level: default_log_level(),
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            mount_root: default_mount_root(),
            max_background_creates: default_max_background_creates(),
            backends: vec![BackendConfig::new(DEFAULT_BACKEND)],
        }
    }

    /// Load from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHAREPLANE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.node_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "node_ip is not an IP address: {}",
                self.node_ip
            )));
        }
        if self.backends.is_empty() {
            return Err(Error::InvalidConfig("no backends configured".into()));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate backend: {}",
                    backend.name
                )));
            }
            if backend.max_shares_per_container == 0 {
                return Err(Error::InvalidConfig(format!(
                    "backend {}: max_shares_per_container must be positive",
                    backend.name
                )));
            }
        }

        if self.lock.poll_interval_ms == 0 || self.lock.ttl_ms == 0 {
            return Err(Error::InvalidConfig(
                "lock ttl and poll interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::NotFound(format!("backend {}", name)))
    }
}
