//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shareplane::common::{Config, KVStore, MemStore, DEFAULT_BACKEND};
use shareplane::provisioner::{ArrayMediator, InMemoryArray, Mounter, Protocol, Provisioner};
use shareplane::Result;

/// Mounter that only records what it was asked to do
#[derive(Default)]
pub struct RecordingMounter {
    pub mounted: Mutex<Vec<(String, PathBuf)>>,
    pub unmounted: Mutex<Vec<PathBuf>>,
}

impl RecordingMounter {
    pub fn mounts(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }

    pub fn unmounts(&self) -> usize {
        self.unmounted.lock().unwrap().len()
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn mount(
        &self,
        _protocol: Protocol,
        export: &str,
        target: &Path,
        _options: Option<&str>,
    ) -> Result<()> {
        self.mounted
            .lock()
            .unwrap()
            .push((export.to_string(), target.to_path_buf()));
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounted.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }
}

pub fn node_config(node_id: &str, node_ip: &str) -> Config {
    let mut config = Config::for_node(node_id, node_ip);
    config.mount_root = PathBuf::from("/mnt/shareplane");
    config.lock.acquire_timeout_ms = 10_000;
    config.lock.poll_interval_ms = 5;
    let backend = &mut config.backends[0];
    backend.default_pool = Some("cpg_a".to_string());
    backend.max_shares_per_container = 2;
    config
}

/// One node of a test cluster
pub struct Node {
    pub engine: Arc<Provisioner>,
    pub mounter: Arc<RecordingMounter>,
}

pub async fn start_node(
    node_id: &str,
    node_ip: &str,
    store: Arc<dyn KVStore>,
    array: Arc<InMemoryArray>,
) -> Node {
    start_node_with(node_config(node_id, node_ip), store, array).await
}

/// Node with its own config and array mediator
pub async fn start_node_with(
    config: Config,
    store: Arc<dyn KVStore>,
    array: Arc<dyn ArrayMediator>,
) -> Node {
    let mounter = Arc::new(RecordingMounter::default());
    let engine = Provisioner::builder(config)
        .store(store)
        .mounter(mounter.clone())
        .backend_array(DEFAULT_BACKEND, array)
        .connect()
        .await
        .unwrap();
    Node { engine, mounter }
}

/// Single node over a fresh in-memory store and array
pub async fn single_node() -> (Node, Arc<InMemoryArray>) {
    let array = Arc::new(InMemoryArray::new());
    let node = start_node(
        "node-1",
        "10.0.0.5",
        Arc::new(MemStore::new()),
        array.clone(),
    )
    .await;
    (node, array)
}
