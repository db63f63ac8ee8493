//! Ops commands for cluster maintenance

pub mod verify;

pub use crate::provisioner::lock::break_expired_locks;
pub use verify::{verify_cluster, CountMismatch, VerifyReport};
