//! Container placement for new shares
//!
//! A share lands on a container (FPG/VFS pair). The planner decides which:
//! an explicitly named container, the pool's current default container, or a
//! brand new container whose names come from the backend's monotonic counter.
//! Capacity and name allocation live in the backend's allocation metadata and
//! are only changed through compare-and-swap, never under a share lock.

use std::sync::Arc;

use tracing::info;

use crate::common::{BackendConfig, Error, Result};
use crate::provisioner::array::ContainerInfo;
use crate::provisioner::metadata::{ContainerAlloc, MetadataRepository};
use crate::provisioner::service::CreateRequest;

/// Where the pipeline should try to put a share
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Container named by the request; created if the array lacks it
    Explicit {
        fpg: String,
        vfs: Option<String>,
        pool: Option<String>,
    },
    /// The pool's current default container
    PoolDefault { pool: String },
    /// Create this container first
    NewContainer {
        pool: String,
        fpg: String,
        vfs: String,
        make_default: bool,
    },
}

impl Placement {
    pub fn describe(&self) -> String {
        match self {
            Placement::Explicit { fpg, .. } => format!("container {}", fpg),
            Placement::PoolDefault { pool } => format!("default container of pool {}", pool),
            Placement::NewContainer { fpg, vfs, .. } => format!("new container {}/{}", fpg, vfs),
        }
    }
}

/// AllocationPlanner handles placement and capacity for one backend.
pub struct AllocationPlanner {
    repo: Arc<MetadataRepository>,
    backend: BackendConfig,
}

impl AllocationPlanner {
    pub fn new(repo: Arc<MetadataRepository>, backend: BackendConfig) -> Self {
        Self { repo, backend }
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn max_shares(&self) -> usize {
        self.backend.max_shares_per_container
    }

    /// First placement to attempt for a request
    pub fn initial(&self, request: &CreateRequest) -> Result<Placement> {
        match (&request.fpg, &request.vfs) {
            (Some(fpg), vfs) => Ok(Placement::Explicit {
                fpg: fpg.clone(),
                vfs: vfs.clone(),
                pool: request.pool.clone(),
            }),
            (None, Some(vfs)) => Err(Error::InvalidPlacement(format!(
                "vfs {} given without its fpg",
                vfs
            ))),
            (None, None) => Ok(Placement::PoolDefault {
                pool: self.resolve_pool(request.pool.as_deref())?,
            }),
        }
    }

    /// Placement to retry with after `attempted` failed with `cause`.
    /// Returns `cause` when no fallback applies.
    pub fn fallback(&self, attempted: &Placement, cause: Error) -> Result<Placement> {
        match (attempted, &cause) {
            // a missing container is created as `<fpg>_vfs`, whatever vfs was asked for
            (Placement::Explicit { fpg, pool, .. }, Error::ContainerNotFound(_)) => {
                let pool = self.resolve_pool(pool.as_deref())?;
                let vfs = format!("{}_vfs", fpg);
                info!(
                    "Container {} does not exist on backend {}, creating it with vfs {}",
                    fpg, self.backend.name, vfs
                );
                Ok(Placement::NewContainer {
                    pool,
                    fpg: fpg.clone(),
                    vfs,
                    make_default: false,
                })
            }
            (
                Placement::PoolDefault { pool },
                Error::DefaultContainerMissing { .. } | Error::CapacityExceeded { .. },
            ) => {
                let (fpg, vfs) = self.generate_names(pool)?;
                info!(
                    "Default container of pool {} unusable ({}), moving to {}/{}",
                    pool, cause, fpg, vfs
                );
                Ok(Placement::NewContainer {
                    pool: pool.clone(),
                    fpg,
                    vfs,
                    make_default: true,
                })
            }
            _ => Err(cause),
        }
    }

    /// Requested pool, or the backend's default pool
    pub fn resolve_pool(&self, requested: Option<&str>) -> Result<String> {
        requested
            .map(str::to_string)
            .or_else(|| self.backend.default_pool.clone())
            .ok_or_else(|| {
                Error::InvalidPlacement(format!(
                    "no pool or container given and backend {} has no default pool",
                    self.backend.name
                ))
            })
    }

    /// Allocate a fresh FPG/VFS name pair for `pool`.
    ///
    /// The counter increment is committed before the names are returned, so
    /// concurrent callers on any node never receive the same pair.
    pub fn generate_names(&self, pool: &str) -> Result<(String, String)> {
        let n = self.repo.update_backend(&self.backend.name, |meta| {
            meta.counter += 1;
            Ok(meta.counter)
        })?;
        Ok((
            format!("{}_{}_{}", self.backend.fpg_prefix, pool, n),
            format!("{}_{}_{}", self.backend.vfs_prefix, pool, n),
        ))
    }

    /// The pool's current default container
    pub fn default_container(&self, pool: &str) -> Result<ContainerInfo> {
        let missing = || Error::DefaultContainerMissing {
            backend: self.backend.name.clone(),
            pool: pool.to_string(),
        };

        let meta = self.repo.get_backend(&self.backend.name)?.ok_or_else(missing)?;
        let fpg = meta.default_container(pool).ok_or_else(missing)?;
        let alloc = meta.containers.get(fpg).ok_or_else(missing)?;
        Ok(ContainerInfo {
            fpg: fpg.to_string(),
            vfs: alloc.vfs.clone(),
            pool: alloc.pool.clone(),
            vfs_ips: alloc.vfs_ips.clone(),
        })
    }

    /// Take one share slot on `container`, registering the container if the
    /// metadata does not know it yet.
    pub fn reserve_slot(&self, container: &ContainerInfo) -> Result<()> {
        let max = self.max_shares();
        self.repo.update_backend(&self.backend.name, |meta| {
            let alloc = meta
                .containers
                .entry(container.fpg.clone())
                .or_insert_with(|| ContainerAlloc {
                    pool: container.pool.clone(),
                    vfs: container.vfs.clone(),
                    vfs_ips: container.vfs_ips.clone(),
                    share_count: 0,
                });
            if alloc.share_count >= max {
                return Err(Error::CapacityExceeded {
                    container: container.fpg.clone(),
                    max,
                });
            }
            alloc.share_count += 1;
            Ok(())
        })
    }

    pub fn release_slot(&self, fpg: &str) -> Result<()> {
        self.repo.update_backend(&self.backend.name, |meta| {
            if let Some(alloc) = meta.containers.get_mut(fpg) {
                alloc.share_count = alloc.share_count.saturating_sub(1);
            }
            Ok(())
        })
    }

    /// Record a container the engine just created, holding one slot for the
    /// share being placed on it. Returns the pool's previous default when
    /// `make_default` moved it.
    pub fn register_container(
        &self,
        container: &ContainerInfo,
        make_default: bool,
    ) -> Result<Option<String>> {
        self.repo.update_backend(&self.backend.name, |meta| {
            let alloc = meta
                .containers
                .entry(container.fpg.clone())
                .or_insert_with(|| ContainerAlloc {
                    pool: container.pool.clone(),
                    vfs: container.vfs.clone(),
                    vfs_ips: container.vfs_ips.clone(),
                    share_count: 0,
                });
            alloc.share_count += 1;

            if !make_default {
                return Ok(None);
            }
            Ok(meta
                .default_containers
                .insert(container.pool.clone(), Some(container.fpg.clone()))
                .flatten())
        })
    }

    /// Undo [`register_container`](Self::register_container): give back the
    /// slot it took. The entry is only dropped, and the default pointer only
    /// restored, once no other share holds a slot on `container`. Returns
    /// whether the container is now unused.
    pub fn unregister_container(
        &self,
        container: &ContainerInfo,
        made_default: bool,
        previous_default: Option<String>,
    ) -> Result<bool> {
        self.repo.update_backend(&self.backend.name, |meta| {
            let Some(alloc) = meta.containers.get_mut(&container.fpg) else {
                return Ok(true);
            };
            alloc.share_count = alloc.share_count.saturating_sub(1);
            if alloc.share_count > 0 {
                return Ok(false);
            }

            meta.containers.remove(&container.fpg);
            if made_default
                && meta.default_container(&container.pool) == Some(container.fpg.as_str())
            {
                meta.default_containers
                    .insert(container.pool.clone(), previous_default.clone());
            }
            Ok(true)
        })
    }

    /// Whether any share holds a slot on `fpg`
    pub fn container_in_use(&self, fpg: &str) -> Result<bool> {
        Ok(self
            .repo
            .get_backend(&self.backend.name)?
            .and_then(|meta| meta.containers.get(fpg).map(|alloc| alloc.share_count > 0))
            .unwrap_or(false))
    }
}
