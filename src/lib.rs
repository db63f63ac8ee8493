//! # shareplane
//!
//! Control plane for provisioning file shares on storage arrays:
//! - Cluster-wide per-share locks with leases over a shared coordination store
//! - Container placement with capacity limits and collision-free naming
//! - Multi-step provisioning with compensating rollback
//! - Per-node mount tracking and array access grants
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Provisioner                  │
//! │   create / remove / mount / unmount / get    │
//! └───┬──────────────┬──────────────┬────────────┘
//!     │ lock         │ pipeline     │ mount
//! ┌───▼──────┐  ┌────▼────────┐  ┌──▼───────────────┐
//! │ Lock     │  │ Allocation  │  │ Mount            │
//! │ Manager  │  │ Planner     │  │ Coordinator      │
//! └───┬──────┘  └────┬────────┘  └──┬───────────────┘
//!     │              │   ArrayMediator (per backend)
//! ┌───▼──────────────▼──────────────▼──┐
//! │  Metadata Repository (KVStore)     │
//! │  shares/ · backends/ · locks/      │
//! └────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # async fn run() -> shareplane::Result<()> {
//! use std::sync::Arc;
//! use shareplane::common::{Config, MemStore};
//! use shareplane::provisioner::{CreateRequest, InMemoryArray, Provisioner};
//!
//! let config = Config::for_node("node-1", "10.0.0.5");
//! let engine = Provisioner::builder(config)
//!     .store(Arc::new(MemStore::new()))
//!     .backend_array("DEFAULT", Arc::new(InMemoryArray::new()))
//!     .connect()
//!     .await?;
//!
//! let share = engine
//!     .create("scratch", CreateRequest { pool: Some("cpg_a".into()), ..Default::default() })
//!     .await?;
//! let mount = engine.mount(&share.name, "container-1").await?;
//! println!("mounted at {}", mount.mount_dir.display());
//! # Ok(())
//! # }
//! ```
//!
//! ### Inspect the store
//! ```bash
//! shareplane --config shareplane.toml list
//! shareplane --config shareplane.toml verify
//! shareplane --config shareplane.toml break-locks
//! ```

pub mod common;
pub mod ops;
pub mod provisioner;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use provisioner::{CreateRequest, Provisioner, ShareRecord};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
