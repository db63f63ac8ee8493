//! Common utilities and types shared across shareplane

pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

pub use config::{BackendConfig, Config, LockConfig, StoreConfig, StoreKind, DEFAULT_BACKEND};
pub use error::{Error, Result};
pub use storage::{open_store, KVStore, MemStore, RocksStore};
pub use utils::{
    encode_key, retry_with_backoff, timestamp_now_millis, validate_mount_id,
    validate_share_name,
};
