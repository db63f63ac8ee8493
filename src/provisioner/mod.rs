//! Share provisioning engine
//!
//! - `lock`: cluster-wide per-share locks with leases
//! - `metadata`: share records and backend allocation metadata
//! - `placement`: container selection, naming and capacity
//! - `pipeline`: step pipelines with compensating rollback
//! - `mount`: per-node mount state and array access grants
//! - `array`: the storage array seam
//! - `service`: the engine facade tying them together

pub mod array;
pub mod lock;
pub mod metadata;
pub mod mount;
pub mod pipeline;
pub mod placement;
pub mod service;

pub use array::{ArrayMediator, ArrayOp, ContainerInfo, InMemoryArray, TimedMediator};
pub use lock::{break_expired_locks, list_locks, LockGuard, LockManager, LockRecord, StoreLockManager};
pub use metadata::{BackendMetadata, ContainerAlloc, MetadataRepository, Protocol, ShareRecord};
pub use mount::{mount_dir, CommandMounter, MountCoordinator, MountInfo, Mounter};
pub use pipeline::{Pipeline, Step};
pub use placement::{AllocationPlanner, Placement};
pub use service::{CreateRequest, Provisioner, ProvisionerBuilder};
