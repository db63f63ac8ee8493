//! Storage array mediator
//!
//! The engine never talks to an array directly: every create, delete, quota
//! and access-list change goes through [`ArrayMediator`]. The transport
//! (REST, SSH) lives behind the trait.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::provisioner::metadata::ShareRecord;

/// A container (FPG/VFS pair) as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub fpg: String,
    pub vfs: String,
    pub pool: String,
    pub vfs_ips: Vec<String>,
}

#[async_trait]
pub trait ArrayMediator: Send + Sync {
    /// Connect and validate credentials
    async fn setup(&self, timeout: Duration) -> Result<()>;

    /// Look up a container; `ContainerNotFound` if the FPG does not exist
    async fn get_container(&self, fpg: &str) -> Result<ContainerInfo>;

    async fn create_container(
        &self,
        pool: &str,
        fpg: &str,
        vfs: &str,
        size_gib: u64,
    ) -> Result<ContainerInfo>;

    async fn delete_container(&self, fpg: &str) -> Result<()>;

    /// Create a file store + share inside `container`. Returns the array's
    /// identifier for the share.
    async fn create_share(
        &self,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<String>;

    async fn delete_share(&self, share: &ShareRecord) -> Result<()>;

    async fn set_quota(
        &self,
        pool: &str,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<()>;

    async fn add_access_ip(&self, share_id: &str, ip: &str) -> Result<()>;

    async fn remove_access_ip(&self, share_id: &str, ip: &str) -> Result<()>;
}

/// Bounds every call of the wrapped mediator; an elapsed call fails with
/// `BackendCommunication` like any other transport failure.
pub struct TimedMediator {
    inner: Arc<dyn ArrayMediator>,
    timeout: Duration,
}

impl TimedMediator {
    pub fn new(inner: Arc<dyn ArrayMediator>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendCommunication(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ArrayMediator for TimedMediator {
    async fn setup(&self, timeout: Duration) -> Result<()> {
        // setup carries its own deadline
        match tokio::time::timeout(timeout, self.inner.setup(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("array setup after {:?}", timeout))),
        }
    }

    async fn get_container(&self, fpg: &str) -> Result<ContainerInfo> {
        self.bounded("get_container", self.inner.get_container(fpg))
            .await
    }

    async fn create_container(
        &self,
        pool: &str,
        fpg: &str,
        vfs: &str,
        size_gib: u64,
    ) -> Result<ContainerInfo> {
        self.bounded(
            "create_container",
            self.inner.create_container(pool, fpg, vfs, size_gib),
        )
        .await
    }

    async fn delete_container(&self, fpg: &str) -> Result<()> {
        self.bounded("delete_container", self.inner.delete_container(fpg))
            .await
    }

    async fn create_share(
        &self,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<String> {
        self.bounded(
            "create_share",
            self.inner.create_share(container, fstore, size_gib),
        )
        .await
    }

    async fn delete_share(&self, share: &ShareRecord) -> Result<()> {
        self.bounded("delete_share", self.inner.delete_share(share))
            .await
    }

    async fn set_quota(
        &self,
        pool: &str,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<()> {
        self.bounded(
            "set_quota",
            self.inner.set_quota(pool, container, fstore, size_gib),
        )
        .await
    }

    async fn add_access_ip(&self, share_id: &str, ip: &str) -> Result<()> {
        self.bounded("add_access_ip", self.inner.add_access_ip(share_id, ip))
            .await
    }

    async fn remove_access_ip(&self, share_id: &str, ip: &str) -> Result<()> {
        self.bounded(
            "remove_access_ip",
            self.inner.remove_access_ip(share_id, ip),
        )
        .await
    }
}

/// Mediator operations, for call accounting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayOp {
    Setup,
    GetContainer,
    CreateContainer,
    DeleteContainer,
    CreateShare,
    DeleteShare,
    SetQuota,
    AddAccessIp,
    RemoveAccessIp,
}

#[derive(Debug, Clone)]
pub struct ArrayShare {
    pub fpg: String,
    pub fstore: String,
    pub size_gib: u64,
    pub quota_gib: Option<u64>,
    pub client_ips: BTreeSet<String>,
}

#[derive(Default)]
struct ArrayState {
    containers: HashMap<String, ContainerInfo>,
    shares: HashMap<String, ArrayShare>,
    calls: HashMap<ArrayOp, usize>,
    failing: HashSet<ArrayOp>,
    next_share_id: u64,
    next_vfs_ip: u8,
}

/// Array kept entirely in memory, with call counters and fault injection.
/// Serves dry runs and tests.
#[derive(Default)]
pub struct InMemoryArray {
    state: Mutex<ArrayState>,
    latency: Option<Duration>,
}

impl InMemoryArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to widen race windows
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::new(ArrayState::default()),
            latency: Some(latency),
        }
    }

    /// Make every future call of `op` fail with `BackendCommunication`
    pub fn fail(&self, op: ArrayOp) {
        self.lock().failing.insert(op);
    }

    pub fn heal(&self, op: ArrayOp) {
        self.lock().failing.remove(&op);
    }

    pub fn calls(&self, op: ArrayOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Register a container created outside the engine
    pub fn add_container(&self, info: ContainerInfo) {
        self.lock().containers.insert(info.fpg.clone(), info);
    }

    pub fn has_container(&self, fpg: &str) -> bool {
        self.lock().containers.contains_key(fpg)
    }

    pub fn share_count(&self) -> usize {
        self.lock().shares.len()
    }

    pub fn share(&self, share_id: &str) -> Option<ArrayShare> {
        self.lock().shares.get(share_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArrayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: ArrayOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if state.failing.contains(&op) {
            return Err(Error::BackendCommunication(format!(
                "injected failure in {:?}",
                op
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArrayMediator for InMemoryArray {
    async fn setup(&self, _timeout: Duration) -> Result<()> {
        self.enter(ArrayOp::Setup).await
    }

    async fn get_container(&self, fpg: &str) -> Result<ContainerInfo> {
        self.enter(ArrayOp::GetContainer).await?;
        self.lock()
            .containers
            .get(fpg)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(fpg.to_string()))
    }

    async fn create_container(
        &self,
        pool: &str,
        fpg: &str,
        vfs: &str,
        _size_gib: u64,
    ) -> Result<ContainerInfo> {
        self.enter(ArrayOp::CreateContainer).await?;
        let mut state = self.lock();
        if state.containers.contains_key(fpg) {
            return Err(Error::AlreadyExists(format!("container {}", fpg)));
        }
        state.next_vfs_ip = state.next_vfs_ip.wrapping_add(1);
        let info = ContainerInfo {
            fpg: fpg.to_string(),
            vfs: vfs.to_string(),
            pool: pool.to_string(),
            vfs_ips: vec![format!("192.168.100.{}", state.next_vfs_ip)],
        };
        state.containers.insert(fpg.to_string(), info.clone());
        Ok(info)
    }

    async fn delete_container(&self, fpg: &str) -> Result<()> {
        self.enter(ArrayOp::DeleteContainer).await?;
        let mut state = self.lock();
        if state.shares.values().any(|s| s.fpg == fpg) {
            return Err(Error::BackendCommunication(format!(
                "container {} is not empty",
                fpg
            )));
        }
        state
            .containers
            .remove(fpg)
            .map(|_| ())
            .ok_or_else(|| Error::ContainerNotFound(fpg.to_string()))
    }

    async fn create_share(
        &self,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<String> {
        self.enter(ArrayOp::CreateShare).await?;
        let mut state = self.lock();
        if !state.containers.contains_key(&container.fpg) {
            return Err(Error::ContainerNotFound(container.fpg.clone()));
        }
        state.next_share_id += 1;
        let share_id = format!("share-{}", state.next_share_id);
        state.shares.insert(
            share_id.clone(),
            ArrayShare {
                fpg: container.fpg.clone(),
                fstore: fstore.to_string(),
                size_gib,
                quota_gib: None,
                client_ips: BTreeSet::new(),
            },
        );
        Ok(share_id)
    }

    async fn delete_share(&self, share: &ShareRecord) -> Result<()> {
        self.enter(ArrayOp::DeleteShare).await?;
        self.lock()
            .shares
            .remove(&share.backend_share_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("array share {}", share.backend_share_id)))
    }

    async fn set_quota(
        &self,
        _pool: &str,
        container: &ContainerInfo,
        fstore: &str,
        size_gib: u64,
    ) -> Result<()> {
        self.enter(ArrayOp::SetQuota).await?;
        let mut state = self.lock();
        let share = state
            .shares
            .values_mut()
            .find(|s| s.fpg == container.fpg && s.fstore == fstore)
            .ok_or_else(|| Error::NotFound(format!("file store {}", fstore)))?;
        share.quota_gib = Some(size_gib);
        Ok(())
    }

    async fn add_access_ip(&self, share_id: &str, ip: &str) -> Result<()> {
        self.enter(ArrayOp::AddAccessIp).await?;
        let mut state = self.lock();
        let share = state
            .shares
            .get_mut(share_id)
            .ok_or_else(|| Error::NotFound(format!("array share {}", share_id)))?;
        share.client_ips.insert(ip.to_string());
        Ok(())
    }

    async fn remove_access_ip(&self, share_id: &str, ip: &str) -> Result<()> {
        self.enter(ArrayOp::RemoveAccessIp).await?;
        let mut state = self.lock();
        let share = state
            .shares
            .get_mut(share_id)
            .ok_or_else(|| Error::NotFound(format!("array share {}", share_id)))?;
        share.client_ips.remove(ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_array_share_lifecycle() {
        let array = InMemoryArray::new();
        let container = array
            .create_container("cpg_a", "fpg_1", "vfs_1", 1024)
            .await
            .unwrap();
        assert_eq!(container.vfs_ips.len(), 1);

        let id = array.create_share(&container, "alpha", 10).await.unwrap();
        array
            .set_quota("cpg_a", &container, "alpha", 10)
            .await
            .unwrap();
        array.add_access_ip(&id, "10.0.0.5").await.unwrap();

        let share = array.share(&id).unwrap();
        assert_eq!(share.quota_gib, Some(10));
        assert!(share.client_ips.contains("10.0.0.5"));

        assert!(array.delete_container("fpg_1").await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let array = InMemoryArray::new();
        array.fail(ArrayOp::GetContainer);
        assert!(matches!(
            array.get_container("fpg_1").await,
            Err(Error::BackendCommunication(_))
        ));
        array.heal(ArrayOp::GetContainer);
        assert!(matches!(
            array.get_container("fpg_1").await,
            Err(Error::ContainerNotFound(_))
        ));
        assert_eq!(array.calls(ArrayOp::GetContainer), 2);
    }

    #[tokio::test]
    async fn test_timed_mediator_times_out() {
        let slow = Arc::new(InMemoryArray::with_latency(Duration::from_millis(200)));
        let timed = TimedMediator::new(slow, Duration::from_millis(10));
        assert!(matches!(
            timed.get_container("fpg_1").await,
            Err(Error::BackendCommunication(_))
        ));
    }
}
