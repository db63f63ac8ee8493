//! Provisioning engine facade
//!
//! Every operation on a share runs under that share's cluster-wide lock:
//! create, remove, mount and unmount of one name are totally ordered across
//! nodes, while different names proceed in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::common::{
    retry_with_backoff, validate_mount_id, validate_share_name, Config, Error, KVStore, Result,
    DEFAULT_BACKEND,
};
use crate::provisioner::array::{ArrayMediator, TimedMediator};
use crate::provisioner::lock::{LockManager, StoreLockManager};
use crate::provisioner::metadata::{MetadataRepository, Protocol, ShareRecord};
use crate::provisioner::mount::{CommandMounter, MountCoordinator, MountInfo, Mounter};
use crate::provisioner::pipeline::{
    create_pipeline, delete_pipeline, CreateContext, DeleteContext, StepDeps,
};
use crate::provisioner::placement::{AllocationPlanner, Placement};

/// Attempts at array setup before `connect` gives up
const SETUP_ATTEMPTS: usize = 3;

/// Parameters of a share creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    /// Backend name; the default backend when unset
    pub backend: Option<String>,
    pub pool: Option<String>,
    pub fpg: Option<String>,
    pub vfs: Option<String>,
    /// File store name; the share name when unset
    pub fstore: Option<String>,
    pub size_gib: Option<u64>,
    pub protocol: Protocol,
    pub share_dir: Option<String>,
    pub readonly: bool,
    pub protocol_opts: Option<String>,
    pub soft_quota_gib: Option<u64>,
    pub hard_quota_gib: Option<u64>,
    pub allow_ips: Vec<String>,
    pub deny_ips: Vec<String>,
    pub comment: Option<String>,
}

struct BackendHandle {
    deps: Arc<StepDeps>,
    mounts: MountCoordinator,
}

pub struct Provisioner {
    node_id: String,
    repo: Arc<MetadataRepository>,
    locks: Arc<dyn LockManager>,
    backends: HashMap<String, BackendHandle>,
    default_backend: String,
    background: Arc<Semaphore>,
}

pub struct ProvisionerBuilder {
    config: Config,
    store: Option<Arc<dyn KVStore>>,
    mounter: Option<Arc<dyn Mounter>>,
    locks: Option<Arc<dyn LockManager>>,
    arrays: HashMap<String, Arc<dyn ArrayMediator>>,
}

impl ProvisionerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            mounter: None,
            locks: None,
            arrays: HashMap::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn KVStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = Some(mounter);
        self
    }

    /// Replace the store-backed lock manager
    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Array mediator of the configured backend `name`
    pub fn backend_array(mut self, name: impl Into<String>, array: Arc<dyn ArrayMediator>) -> Self {
        self.arrays.insert(name.into(), array);
        self
    }

    /// Set up every backend's array and allocation metadata
    pub async fn connect(mut self) -> Result<Arc<Provisioner>> {
        self.config.validate()?;
        let config = self.config;

        let store = self
            .store
            .ok_or_else(|| Error::InvalidConfig("no coordination store given".into()))?;
        let repo = Arc::new(MetadataRepository::new(store.clone()));
        let mounter = self
            .mounter
            .unwrap_or_else(|| Arc::new(CommandMounter));
        let locks = self.locks.unwrap_or_else(|| {
            Arc::new(StoreLockManager::new(
                store.clone(),
                config.node_id.clone(),
                config.lock.clone(),
            ))
        });

        let mut backends = HashMap::new();
        for backend in &config.backends {
            let raw = self.arrays.remove(&backend.name).ok_or_else(|| {
                Error::InvalidConfig(format!("no array mediator for backend {}", backend.name))
            })?;
            let array: Arc<dyn ArrayMediator> =
                Arc::new(TimedMediator::new(raw, backend.array_call_timeout()));

            let setup_timeout = backend.setup_timeout();
            retry_with_backoff(
                || array.setup(setup_timeout),
                SETUP_ATTEMPTS,
                Duration::from_millis(500),
            )
            .await?;
            repo.init_backend(&backend.name, backend.default_pool.as_deref())?;

            let planner = Arc::new(AllocationPlanner::new(repo.clone(), backend.clone()));
            let deps = Arc::new(StepDeps {
                backend: backend.clone(),
                repo: repo.clone(),
                planner,
                array: array.clone(),
            });
            let mounts = MountCoordinator::new(
                repo.clone(),
                array,
                mounter.clone(),
                config.node_id.clone(),
                config.node_ip.clone(),
                config.mount_root.clone(),
            );
            info!("Backend {} ready", backend.name);
            backends.insert(backend.name.clone(), BackendHandle { deps, mounts });
        }

        if let Some(name) = self.arrays.keys().next() {
            warn!("Ignoring array mediator of unconfigured backend {}", name);
        }

        let default_backend = if backends.contains_key(DEFAULT_BACKEND) {
            DEFAULT_BACKEND.to_string()
        } else {
            config
                .backends
                .first()
                .map(|b| b.name.clone())
                .ok_or_else(|| Error::InvalidConfig("no backends configured".into()))?
        };

        Ok(Arc::new(Provisioner {
            node_id: config.node_id,
            repo,
            locks,
            backends,
            default_backend,
            background: Arc::new(Semaphore::new(config.max_background_creates.max(1))),
        }))
    }
}

impl Provisioner {
    pub fn builder(config: Config) -> ProvisionerBuilder {
        ProvisionerBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn repository(&self) -> &Arc<MetadataRepository> {
        &self.repo
    }

    fn backend(&self, name: Option<&str>) -> Result<&BackendHandle> {
        let name = name.unwrap_or(&self.default_backend);
        self.backends
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("backend {}", name)))
    }

    /// Run `op` while holding the lock on `name`
    async fn locked<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.locks.acquire(name).await?;
        let result = op().await;
        if let Err(e) = guard.release() {
            warn!("Failed to release lock on {}: {}", name, e);
        }
        result
    }

    /// Create a share, or return the existing record of that name
    pub async fn create(&self, name: &str, request: CreateRequest) -> Result<ShareRecord> {
        validate_share_name(name)?;
        let handle = self.backend(request.backend.as_deref())?;
        let placement = handle.deps.planner.initial(&request)?;

        self.locked(name, || self.create_locked(handle, name, request, placement))
            .await
    }

    async fn create_locked(
        &self,
        handle: &BackendHandle,
        name: &str,
        request: CreateRequest,
        placement: Placement,
    ) -> Result<ShareRecord> {
        if let Some(existing) = self.repo.get_share(name)? {
            info!("Share {} already exists, nothing to create", name);
            return Ok(existing);
        }

        info!("Creating share {} on {}", name, placement.describe());
        let record = match self.run_create(handle, name, request, placement).await {
            Ok(record) => record,
            // a writer that outlived its lock recorded the share first; our
            // array work has been rolled back
            Err(Error::AlreadyExists(what)) => match self.repo.get_share(name)? {
                Some(existing) => {
                    warn!(
                        "Share {} was recorded by another writer during creation, returning that record",
                        name
                    );
                    return Ok(existing);
                }
                None => return Err(Error::AlreadyExists(what)),
            },
            Err(e) => return Err(e),
        };

        info!(
            "Share {} created on {}/{} ({})",
            record.name, record.fpg, record.vfs, record.backend_share_id
        );
        Ok(record)
    }

    /// Run the pipeline for `placement`, then its fallback if one applies
    async fn run_create(
        &self,
        handle: &BackendHandle,
        name: &str,
        request: CreateRequest,
        placement: Placement,
    ) -> Result<ShareRecord> {
        let mut ctx = CreateContext::new(name, request.clone(), placement.clone());
        let outcome = create_pipeline(&handle.deps, &placement)
            .run(&mut ctx)
            .await;
        match outcome {
            Ok(()) => ctx.into_record(),
            Err(e) if e.triggers_new_container() => {
                let next = handle.deps.planner.fallback(&placement, e)?;
                info!("Retrying share {} on {}", name, next.describe());
                let mut ctx = CreateContext::new(name, request, next.clone());
                create_pipeline(&handle.deps, &next).run(&mut ctx).await?;
                ctx.into_record()
            }
            Err(e) => Err(e),
        }
    }

    /// Create in the background. Request validation errors are returned
    /// immediately; the outcome of the creation itself is only logged.
    pub fn submit_create(
        self: &Arc<Self>,
        name: &str,
        request: CreateRequest,
    ) -> Result<JoinHandle<()>> {
        validate_share_name(name)?;
        self.backend(request.backend.as_deref())?;

        let this = self.clone();
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let _permit = match this.background.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Background creation of {} dropped: engine shut down", name);
                    return;
                }
            };
            match this.create(&name, request).await {
                Ok(record) => info!(
                    "Background creation of {} finished on {}/{}",
                    name, record.fpg, record.vfs
                ),
                Err(e) => error!("Background creation of {} failed: {}", name, e),
            }
        }))
    }

    /// Delete a share. Refused while any node has it mounted.
    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_share_name(name)?;
        self.locked(name, || async move {
            let record = self.repo.require_share(name)?;
            if record.is_mounted() {
                let nodes: Vec<&str> = record.mount_state.keys().map(String::as_str).collect();
                return Err(Error::ResourceInUse(format!(
                    "share {} is mounted on {}",
                    name,
                    nodes.join(", ")
                )));
            }

            let handle = self.backend(Some(&record.backend))?;
            let mut ctx = DeleteContext { record };
            delete_pipeline(&handle.deps).run(&mut ctx).await?;
            info!("Share {} removed", name);
            Ok(())
        })
        .await
    }

    pub async fn mount(&self, name: &str, mount_id: &str) -> Result<MountInfo> {
        validate_share_name(name)?;
        validate_mount_id(mount_id)?;
        self.locked(name, || async move {
            let record = self.repo.require_share(name)?;
            let handle = self.backend(Some(&record.backend))?;
            handle.mounts.mount(record, mount_id).await
        })
        .await
    }

    pub async fn unmount(&self, name: &str, mount_id: &str) -> Result<()> {
        validate_share_name(name)?;
        validate_mount_id(mount_id)?;
        self.locked(name, || async move {
            let record = self.repo.require_share(name)?;
            let handle = self.backend(Some(&record.backend))?;
            handle.mounts.unmount(record, mount_id).await?;
            Ok(())
        })
        .await
    }

    pub fn get(&self, name: &str) -> Result<ShareRecord> {
        self.repo.require_share(name)
    }

    pub fn list(&self) -> Result<Vec<ShareRecord>> {
        self.repo.list_shares()
    }

    /// Local mount directory of `name` on this node, if mounted here
    pub fn path(&self, name: &str) -> Result<Option<PathBuf>> {
        let record = self.repo.require_share(name)?;
        let handle = self.backend(Some(&record.backend))?;
        Ok(handle.mounts.path(&record))
    }
}
