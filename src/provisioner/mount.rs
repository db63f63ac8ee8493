//! Per-node mount coordination
//!
//! A share may be mounted several times on one node, once per mount id. The
//! first mount on a node grants the node's address at the array; the last
//! unmount revokes it. Mount state lives in the share record so every node
//! sees who holds the share. Callers hold the share's lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::common::{encode_key, Error, Result};
use crate::provisioner::array::ArrayMediator;
use crate::provisioner::metadata::{MetadataRepository, Protocol, ShareRecord};
use crate::provisioner::pipeline::{Pipeline, Step};

/// Local filesystem mount operations
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `export` at `target`, creating the directory first
    async fn mount(
        &self,
        protocol: Protocol,
        export: &str,
        target: &Path,
        options: Option<&str>,
    ) -> Result<()>;

    /// Unmount `target` and remove the directory. An absent directory counts
    /// as already unmounted.
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// Shells out to `mount` / `umount`
#[derive(Debug, Default, Clone)]
pub struct CommandMounter;

async fn run(cmd: &mut Command, what: String) -> Result<()> {
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(Error::MountFailed(format!(
            "{}: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl Mounter for CommandMounter {
    async fn mount(
        &self,
        protocol: Protocol,
        export: &str,
        target: &Path,
        options: Option<&str>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(target).await?;

        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg(protocol.mount_type());
        if let Some(options) = options {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(export).arg(target);
        run(&mut cmd, format!("mount {} on {}", export, target.display())).await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        if !tokio::fs::try_exists(target).await.unwrap_or(false) {
            debug!("{} does not exist, nothing to unmount", target.display());
            return Ok(());
        }

        run(
            Command::new("umount").arg(target),
            format!("umount {}", target.display()),
        )
        .await?;

        match tokio::fs::remove_dir(target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Deterministic local directory of one mount
pub fn mount_dir(root: &Path, share: &str, mount_id: &str) -> PathBuf {
    root.join(encode_key(share)).join(encode_key(mount_id))
}

/// Options passed to the mount command
fn mount_options(record: &ShareRecord) -> Option<String> {
    let mut options: Vec<&str> = Vec::new();
    if record.readonly {
        options.push("ro");
    }
    if let Some(extra) = record.protocol_opts.as_deref() {
        options.extend(extra.split(',').map(str::trim).filter(|o| !o.is_empty()));
    }
    if options.is_empty() {
        None
    } else {
        Some(options.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub name: String,
    pub mount_id: String,
    pub mount_dir: PathBuf,
    pub export: String,
    /// False when the mount id was already mounted on this node
    pub newly_mounted: bool,
}

pub struct MountCoordinator {
    repo: Arc<MetadataRepository>,
    array: Arc<dyn ArrayMediator>,
    mounter: Arc<dyn Mounter>,
    node_id: String,
    node_ip: String,
    mount_root: PathBuf,
}

struct MountContext {
    record: ShareRecord,
    mount_id: String,
    mount_dir: PathBuf,
    export: String,
}

struct MountDeps {
    repo: Arc<MetadataRepository>,
    array: Arc<dyn ArrayMediator>,
    mounter: Arc<dyn Mounter>,
    node_id: String,
    node_ip: String,
}

struct GrantArrayAccess(Arc<MountDeps>);

#[async_trait]
impl Step<MountContext> for GrantArrayAccess {
    fn name(&self) -> &'static str {
        "grant-array-access"
    }

    async fn execute(&self, ctx: &mut MountContext) -> Result<()> {
        self.0
            .array
            .add_access_ip(&ctx.record.backend_share_id, &self.0.node_ip)
            .await
    }

    async fn compensate(&self, ctx: &mut MountContext) -> Result<()> {
        self.0
            .array
            .remove_access_ip(&ctx.record.backend_share_id, &self.0.node_ip)
            .await
    }
}

struct CountClientGrant(Arc<MountDeps>);

#[async_trait]
impl Step<MountContext> for CountClientGrant {
    fn name(&self) -> &'static str {
        "count-client-grant"
    }

    async fn execute(&self, ctx: &mut MountContext) -> Result<()> {
        self.0.repo.update_backend(&ctx.record.backend, |meta| {
            meta.grant_client(&self.0.node_ip);
            Ok(())
        })
    }

    async fn compensate(&self, ctx: &mut MountContext) -> Result<()> {
        self.0.repo.update_backend(&ctx.record.backend, |meta| {
            meta.revoke_client(&self.0.node_ip);
            Ok(())
        })
    }
}

struct MountExport(Arc<MountDeps>);

#[async_trait]
impl Step<MountContext> for MountExport {
    fn name(&self) -> &'static str {
        "mount-export"
    }

    async fn execute(&self, ctx: &mut MountContext) -> Result<()> {
        let options = mount_options(&ctx.record);
        self.0
            .mounter
            .mount(
                ctx.record.protocol,
                &ctx.export,
                &ctx.mount_dir,
                options.as_deref(),
            )
            .await
    }

    async fn compensate(&self, ctx: &mut MountContext) -> Result<()> {
        self.0.mounter.unmount(&ctx.mount_dir).await
    }
}

struct RecordMount(Arc<MountDeps>);

#[async_trait]
impl Step<MountContext> for RecordMount {
    fn name(&self) -> &'static str {
        "record-mount"
    }

    async fn execute(&self, ctx: &mut MountContext) -> Result<()> {
        let deps = &self.0;
        ctx.record = deps.repo.update_share(&ctx.record.name, |record| {
            record.client_ips.insert(deps.node_ip.clone());
            record
                .mount_state
                .entry(deps.node_id.clone())
                .or_default()
                .insert(ctx.mount_id.clone(), ctx.mount_dir.clone());
            Ok(())
        })?;
        Ok(())
    }
}

impl MountCoordinator {
    pub fn new(
        repo: Arc<MetadataRepository>,
        array: Arc<dyn ArrayMediator>,
        mounter: Arc<dyn Mounter>,
        node_id: impl Into<String>,
        node_ip: impl Into<String>,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            array,
            mounter,
            node_id: node_id.into(),
            node_ip: node_ip.into(),
            mount_root: mount_root.into(),
        }
    }

    fn deps(&self) -> Arc<MountDeps> {
        Arc::new(MountDeps {
            repo: self.repo.clone(),
            array: self.array.clone(),
            mounter: self.mounter.clone(),
            node_id: self.node_id.clone(),
            node_ip: self.node_ip.clone(),
        })
    }

    /// Mount `record` on this node under `mount_id`
    pub async fn mount(&self, record: ShareRecord, mount_id: &str) -> Result<MountInfo> {
        let export = record.export_path()?;

        if let Some(existing) = record
            .mounts_on(&self.node_id)
            .and_then(|mounts| mounts.get(mount_id))
        {
            info!(
                "Share {} already mounted on {} for {}, nothing to do",
                record.name, self.node_id, mount_id
            );
            return Ok(MountInfo {
                name: record.name.clone(),
                mount_id: mount_id.to_string(),
                mount_dir: existing.clone(),
                export,
                newly_mounted: false,
            });
        }

        let first_on_node = record.mounts_on(&self.node_id).is_none();
        let deps = self.deps();
        let mut pipeline = Pipeline::new("mount-share");
        if first_on_node {
            pipeline = pipeline
                .step(GrantArrayAccess(deps.clone()))
                .step(CountClientGrant(deps.clone()));
        }
        let pipeline = pipeline
            .step(MountExport(deps.clone()))
            .step(RecordMount(deps));

        let mut ctx = MountContext {
            mount_dir: mount_dir(&self.mount_root, &record.name, mount_id),
            export,
            mount_id: mount_id.to_string(),
            record,
        };
        pipeline.run(&mut ctx).await?;

        info!(
            "Mounted {} at {} for {}",
            ctx.export,
            ctx.mount_dir.display(),
            mount_id
        );
        Ok(MountInfo {
            name: ctx.record.name,
            mount_id: ctx.mount_id,
            mount_dir: ctx.mount_dir,
            export: ctx.export,
            newly_mounted: true,
        })
    }

    /// Unmount `mount_id` of `record` on this node. The node's array access
    /// goes away with its last mount id.
    pub async fn unmount(&self, record: ShareRecord, mount_id: &str) -> Result<ShareRecord> {
        let node_mounts = record.mounts_on(&self.node_id).ok_or_else(|| {
            Error::MountStateNotFound(format!(
                "share {} has no mounts on node {}",
                record.name, self.node_id
            ))
        })?;
        let dir = node_mounts.get(mount_id).cloned().ok_or_else(|| {
            Error::MountStateNotFound(format!(
                "share {} has no mount {} on node {}",
                record.name, mount_id, self.node_id
            ))
        })?;
        let last_on_node = node_mounts.len() == 1;

        self.mounter.unmount(&dir).await?;

        if last_on_node {
            self.array
                .remove_access_ip(&record.backend_share_id, &self.node_ip)
                .await?;
        }

        let updated = self.repo.update_share(&record.name, |r| {
            if let Some(mounts) = r.mount_state.get_mut(&self.node_id) {
                mounts.remove(mount_id);
                if mounts.is_empty() {
                    r.mount_state.remove(&self.node_id);
                    r.client_ips.remove(&self.node_ip);
                }
            }
            Ok(())
        })?;

        if last_on_node {
            if let Err(e) = self.repo.update_backend(&record.backend, |meta| {
                meta.revoke_client(&self.node_ip);
                Ok(())
            }) {
                warn!(
                    "Could not drop client grant of {} on backend {}: {}",
                    self.node_ip, record.backend, e
                );
            }
            info!(
                "Last mount of {} on {} gone, revoked {}",
                record.name, self.node_id, self.node_ip
            );
        }

        Ok(updated)
    }

    /// This node's first mount directory of `record`
    pub fn path(&self, record: &ShareRecord) -> Option<PathBuf> {
        record
            .mounts_on(&self.node_id)
            .and_then(|mounts| mounts.values().next().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemStore;
    use crate::provisioner::array::{ArrayOp, ContainerInfo, InMemoryArray};
    use crate::provisioner::metadata::tests::sample_share;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMounter {
        ops: Mutex<Vec<String>>,
        fail_mount: bool,
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount(
            &self,
            _protocol: Protocol,
            export: &str,
            target: &Path,
            _options: Option<&str>,
        ) -> Result<()> {
            if self.fail_mount {
                return Err(Error::MountFailed("no route to host".into()));
            }
            self.ops
                .lock()
                .unwrap()
                .push(format!("mount {} {}", export, target.display()));
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("umount {}", target.display()));
            Ok(())
        }
    }

    struct Fixture {
        repo: Arc<MetadataRepository>,
        array: Arc<InMemoryArray>,
        mounter: Arc<FakeMounter>,
        coordinator: MountCoordinator,
    }

    async fn fixture(mounter: FakeMounter) -> Fixture {
        let repo = Arc::new(MetadataRepository::new(Arc::new(MemStore::new())));
        repo.init_backend("DEFAULT", Some("cpg_a")).unwrap();

        let array = Arc::new(InMemoryArray::new());
        let container = ContainerInfo {
            fpg: "fpg_cpg_a_1".into(),
            vfs: "vfs_cpg_a_1".into(),
            pool: "cpg_a".into(),
            vfs_ips: vec!["10.50.3.21".into()],
        };
        array.add_container(container.clone());
        let share_id = array.create_share(&container, "alpha", 10).await.unwrap();

        let mut share = sample_share("alpha");
        share.backend_share_id = share_id;
        repo.insert_share(&share).unwrap();

        let mounter = Arc::new(mounter);
        let coordinator = MountCoordinator::new(
            repo.clone(),
            array.clone(),
            mounter.clone(),
            "node-1",
            "10.0.0.5",
            "/mnt/shareplane",
        );
        Fixture {
            repo,
            array,
            mounter,
            coordinator,
        }
    }

    #[test]
    fn test_mount_dir_is_deterministic() {
        let root = Path::new("/mnt/shareplane");
        assert_eq!(
            mount_dir(root, "alpha", "c1"),
            PathBuf::from("/mnt/shareplane/alpha/c1")
        );
        assert_eq!(
            mount_dir(root, "a/b", "c1"),
            PathBuf::from("/mnt/shareplane/a%2Fb/c1")
        );
    }

    #[test]
    fn test_mount_options() {
        let mut share = sample_share("alpha");
        assert_eq!(mount_options(&share), None);
        share.readonly = true;
        share.protocol_opts = Some("vers=4.1, noatime".into());
        assert_eq!(mount_options(&share).as_deref(), Some("ro,vers=4.1,noatime"));
    }

    #[tokio::test]
    async fn test_duplicate_mount_id_is_noop() {
        let f = fixture(FakeMounter::default()).await;
        let record = f.repo.require_share("alpha").unwrap();

        let first = f.coordinator.mount(record, "c1").await.unwrap();
        assert!(first.newly_mounted);

        let record = f.repo.require_share("alpha").unwrap();
        let again = f.coordinator.mount(record, "c1").await.unwrap();
        assert!(!again.newly_mounted);
        assert_eq!(again.mount_dir, first.mount_dir);

        assert_eq!(f.mounter.ops.lock().unwrap().len(), 1);
        assert_eq!(f.array.calls(ArrayOp::AddAccessIp), 1);
        let record = f.repo.require_share("alpha").unwrap();
        assert_eq!(record.mounts_on("node-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_unmount_revokes_access() {
        let f = fixture(FakeMounter::default()).await;
        let record = f.repo.require_share("alpha").unwrap();
        f.coordinator.mount(record, "c1").await.unwrap();
        let record = f.repo.require_share("alpha").unwrap();
        f.coordinator.mount(record, "c2").await.unwrap();
        assert_eq!(f.array.calls(ArrayOp::AddAccessIp), 1);

        let record = f.repo.require_share("alpha").unwrap();
        let record = f.coordinator.unmount(record, "c1").await.unwrap();
        assert!(record.client_ips.contains("10.0.0.5"));
        assert_eq!(f.array.calls(ArrayOp::RemoveAccessIp), 0);

        let record = f.coordinator.unmount(record, "c2").await.unwrap();
        assert!(record.mounts_on("node-1").is_none());
        assert!(record.client_ips.is_empty());
        assert_eq!(f.array.calls(ArrayOp::RemoveAccessIp), 1);

        let share = f.array.share(&record.backend_share_id).unwrap();
        assert!(share.client_ips.is_empty());
        let meta = f.repo.get_backend("DEFAULT").unwrap().unwrap();
        assert!(meta.client_grants.is_empty());
        assert!(f.repo.get_share("alpha").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unmount_unknown_mount_id() {
        let f = fixture(FakeMounter::default()).await;
        let record = f.repo.require_share("alpha").unwrap();
        assert!(matches!(
            f.coordinator.unmount(record.clone(), "c1").await,
            Err(Error::MountStateNotFound(_))
        ));

        f.coordinator.mount(record, "c1").await.unwrap();
        let record = f.repo.require_share("alpha").unwrap();
        assert!(matches!(
            f.coordinator.unmount(record, "c9").await,
            Err(Error::MountStateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_mount_revokes_grant() {
        let f = fixture(FakeMounter {
            fail_mount: true,
            ..Default::default()
        })
        .await;
        let record = f.repo.require_share("alpha").unwrap();
        let share_id = record.backend_share_id.clone();

        assert!(matches!(
            f.coordinator.mount(record, "c1").await,
            Err(Error::MountFailed(_))
        ));
        assert_eq!(f.array.calls(ArrayOp::RemoveAccessIp), 1);
        assert!(f.array.share(&share_id).unwrap().client_ips.is_empty());

        let meta = f.repo.get_backend("DEFAULT").unwrap().unwrap();
        assert!(meta.client_grants.is_empty());
        let record = f.repo.require_share("alpha").unwrap();
        assert!(!record.is_mounted());
    }

    #[tokio::test]
    async fn test_path_reports_first_mount() {
        let f = fixture(FakeMounter::default()).await;
        let record = f.repo.require_share("alpha").unwrap();
        assert_eq!(f.coordinator.path(&record), None);

        let info = f.coordinator.mount(record, "c1").await.unwrap();
        let record = f.repo.require_share("alpha").unwrap();
        assert_eq!(f.coordinator.path(&record), Some(info.mount_dir));
    }
}
