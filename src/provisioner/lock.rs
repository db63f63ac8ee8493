//! Cluster-wide share locks
//!
//! A lock is a record at `locks/shares/<name>` written with create-if-absent;
//! its presence is the lock. Each record carries a lease: once
//! `acquired_at_ms + ttl_ms` has passed, another node may take the lock over
//! with a compare-and-swap against the exact record it observed. A live
//! holder keeps extending its lease in the background, so only a holder
//! that crashed loses the lock, and it blocks its share for at most one lease.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::{encode_key, timestamp_now_millis, Error, KVStore, LockConfig, Result};
use crate::provisioner::metadata::{decode, encode};

pub const LOCK_PREFIX: &str = "locks/shares/";

pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, encode_key(name))
}

/// Lock record as persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub token: String,
    /// Start of the current lease, moved forward on every renewal
    pub acquired_at_ms: u64,
    pub ttl_ms: u64,
}

impl LockRecord {
    fn new(owner: &str, ttl_ms: u64) -> Self {
        Self {
            owner: owner.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at_ms: timestamp_now_millis(),
            ttl_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.acquired_at_ms.saturating_add(self.ttl_ms)
    }
}

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Held lock. Released by [`LockGuard::release`] or, failing that, on drop,
/// so error returns, panics and cancelled tasks all give the lock back.
pub struct LockGuard {
    name: String,
    release: Option<ReleaseFn>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: ReleaseFn) -> Self {
        Self {
            name: name.into(),
            release: Some(release),
            heartbeat: None,
        }
    }

    /// Task keeping the lease alive; stopped when the guard is released
    pub fn with_heartbeat(mut self, heartbeat: JoinHandle<()>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) -> Result<()> {
        self.stop_heartbeat();
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if let Some(release) = self.release.take() {
            if let Err(e) = release() {
                warn!("Failed to release lock on {}: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// The lease a guard currently holds; `None` once released or taken over
type HeldLease = Arc<Mutex<Option<(LockRecord, Vec<u8>)>>>;

fn lease(held: &HeldLease) -> std::sync::MutexGuard<'_, Option<(LockRecord, Vec<u8>)>> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// Extend the held lease once. Returns false when there is nothing left to renew.
fn renew_lease(store: &dyn KVStore, key: &str, name: &str, held: &HeldLease) -> bool {
    let mut held = lease(held);
    let Some((record, bytes)) = held.as_ref() else {
        return false;
    };

    let renewed = LockRecord {
        acquired_at_ms: timestamp_now_millis(),
        ..record.clone()
    };
    let renewed_bytes = match encode(&renewed) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode renewed lease on {}: {}", name, e);
            return true;
        }
    };

    match store.compare_and_swap(key, Some(bytes), Some(renewed_bytes.clone())) {
        Ok(true) => {
            debug!("Renewed lease on {}", name);
            *held = Some((renewed, renewed_bytes));
            true
        }
        Ok(false) => {
            warn!("Lease on {} was taken over, no longer renewing it", name);
            *held = None;
            false
        }
        Err(e) => {
            // the lease may still be renewed before it runs out
            warn!("Failed to renew lease on {}: {}", name, e);
            true
        }
    }
}

/// Per-share mutual exclusion across every node sharing the store
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait for the lock on `name`; `LockTimeout` after the bounded wait
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

/// Lock manager backed by the coordination store's conditional writes
pub struct StoreLockManager {
    store: Arc<dyn KVStore>,
    owner: String,
    config: LockConfig,
}

impl StoreLockManager {
    pub fn new(store: Arc<dyn KVStore>, owner: impl Into<String>, config: LockConfig) -> Self {
        Self {
            store,
            owner: owner.into(),
            config,
        }
    }

    fn guard(&self, name: &str, key: String, record: LockRecord, bytes: Vec<u8>) -> LockGuard {
        let held: HeldLease = Arc::new(Mutex::new(Some((record, bytes))));
        let heartbeat = tokio::spawn(heartbeat(
            self.store.clone(),
            key.clone(),
            name.to_string(),
            held.clone(),
            self.config.renew_interval(),
        ));

        let store = self.store.clone();
        let release_name = name.to_string();
        LockGuard::new(
            name,
            Box::new(move || {
                let Some((_, bytes)) = lease(&held).take() else {
                    warn!(
                        "Lock on {} was taken over before release; leaving it to the new holder",
                        release_name
                    );
                    return Ok(());
                };
                if !store.compare_and_swap(&key, Some(&bytes), None)? {
                    warn!(
                        "Lock on {} was taken over before release; leaving it to the new holder",
                        release_name
                    );
                }
                Ok(())
            }),
        )
        .with_heartbeat(heartbeat)
    }

    /// One acquisition attempt
    fn try_acquire(&self, name: &str, key: &str) -> Result<Option<LockGuard>> {
        let record = LockRecord::new(&self.owner, self.config.ttl_ms);
        let bytes = encode(&record)?;

        if self.store.put_if_absent(key, bytes.clone())? {
            debug!("Acquired lock on {}", name);
            return Ok(Some(self.guard(name, key.to_string(), record, bytes)));
        }

        let Some(current) = self.store.get(key)? else {
            // released between the two calls; next attempt will see it free
            return Ok(None);
        };

        let holder: LockRecord = decode(&current)?;
        if holder.is_expired(timestamp_now_millis())
            && self
                .store
                .compare_and_swap(key, Some(&current), Some(bytes.clone()))?
        {
            warn!(
                "Took over expired lock on {} from {} (held since {} ms)",
                name, holder.owner, holder.acquired_at_ms
            );
            return Ok(Some(self.guard(name, key.to_string(), record, bytes)));
        }

        Ok(None)
    }
}

#[async_trait]
impl LockManager for StoreLockManager {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let key = lock_key(name);
        let deadline = Instant::now() + self.config.acquire_timeout();
        let poll = self.config.poll_interval();

        loop {
            if let Some(guard) = self.try_acquire(name, &key)? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout(name.to_string()));
            }

            // jitter keeps contending nodes from polling in lockstep
            let jitter_ms = rand::thread_rng().gen_range(0..=poll.as_millis() as u64 / 2);
            let wait = poll + Duration::from_millis(jitter_ms);
            tokio::time::sleep_until((Instant::now() + wait).min(deadline)).await;
        }
    }
}

async fn heartbeat(
    store: Arc<dyn KVStore>,
    key: String,
    name: String,
    held: HeldLease,
    every: Duration,
) {
    loop {
        tokio::time::sleep(every).await;
        if !renew_lease(store.as_ref(), &key, &name, &held) {
            return;
        }
    }
}

/// All lock records currently in the store
pub fn list_locks(store: &dyn KVStore) -> Result<Vec<(String, LockRecord)>> {
    store
        .list_prefix(LOCK_PREFIX)?
        .into_iter()
        .map(|(key, bytes)| Ok((key, decode::<LockRecord>(&bytes)?)))
        .collect()
}

/// Delete every lock whose lease has expired. Returns how many were removed.
pub fn break_expired_locks(store: &dyn KVStore) -> Result<usize> {
    let now = timestamp_now_millis();
    let mut broken = 0;
    for (key, bytes) in store.list_prefix(LOCK_PREFIX)? {
        let record: LockRecord = decode(&bytes)?;
        if record.is_expired(now) && store.compare_and_swap(&key, Some(&bytes), None)? {
            warn!("Broke expired lock {} held by {}", key, record.owner);
            broken += 1;
        }
    }
    Ok(broken)
}
