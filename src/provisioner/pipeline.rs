//! Provisioning pipelines with compensating rollback
//!
//! A [`Pipeline`] runs its steps in order. When a step fails, every step that
//! already completed is compensated in reverse order and the original error is
//! returned. A failing compensation is logged and does not stop the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::common::{BackendConfig, Error, Result};
use crate::provisioner::array::{ArrayMediator, ContainerInfo};
use crate::provisioner::metadata::{MetadataRepository, ShareRecord};
use crate::provisioner::placement::{AllocationPlanner, Placement};
use crate::provisioner::service::CreateRequest;

/// One reversible unit of work over a context `C`
#[async_trait]
pub trait Step<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<()>;

    /// Undo a successful [`execute`](Step::execute). Steps with nothing to
    /// undo keep the default.
    async fn compensate(&self, _ctx: &mut C) -> Result<()> {
        Ok(())
    }
}

pub struct Pipeline<C: Send> {
    label: &'static str,
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl Step<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut C) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!("[{}] {} started", self.label, step.name());
            if let Err(e) = step.execute(ctx).await {
                error!("[{}] {} failed: {}", self.label, step.name(), e);
                self.compensate(&self.steps[..index], ctx).await;
                return Err(e);
            }
            debug!("[{}] {} done", self.label, step.name());
        }
        Ok(())
    }

    async fn compensate(&self, completed: &[Box<dyn Step<C>>], ctx: &mut C) {
        for step in completed.iter().rev() {
            info!("[{}] rolling back {}", self.label, step.name());
            if let Err(e) = step.compensate(ctx).await {
                let failure = Error::RollbackStepFailed {
                    step: step.name().to_string(),
                    reason: e.to_string(),
                };
                error!("[{}] {}", self.label, failure);
            }
        }
    }
}

/// Collaborators shared by the steps of one backend
pub struct StepDeps {
    pub backend: BackendConfig,
    pub repo: Arc<MetadataRepository>,
    pub planner: Arc<AllocationPlanner>,
    pub array: Arc<dyn ArrayMediator>,
}

// === Create ===

pub struct CreateContext {
    pub name: String,
    pub request: CreateRequest,
    pub placement: Placement,
    pub container: Option<ContainerInfo>,
    pub previous_default: Option<String>,
    pub record: Option<ShareRecord>,
}

impl CreateContext {
    pub fn new(name: &str, request: CreateRequest, placement: Placement) -> Self {
        Self {
            name: name.to_string(),
            request,
            placement,
            container: None,
            previous_default: None,
            record: None,
        }
    }

    fn container(&self) -> Result<&ContainerInfo> {
        self.container
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("no container resolved for {}", self.name)))
    }

    fn record(&self) -> Result<&ShareRecord> {
        self.record
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("no share created for {}", self.name)))
    }

    /// The persisted record of a completed pipeline
    pub fn into_record(self) -> Result<ShareRecord> {
        let name = self.name;
        self.record
            .ok_or_else(|| Error::Internal(format!("pipeline for {} produced no record", name)))
    }

    fn fstore(&self) -> &str {
        self.request.fstore.as_deref().unwrap_or(&self.name)
    }
}

/// Resolve the explicitly named container at the array
pub struct LocateContainer(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for LocateContainer {
    fn name(&self) -> &'static str {
        "locate-container"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let Placement::Explicit { fpg, pool, .. } = &ctx.placement else {
            return Err(Error::Internal("locate-container needs an explicit placement".into()));
        };
        let info = self.0.array.get_container(fpg).await?;
        if let Some(pool) = pool {
            if *pool != info.pool {
                return Err(Error::InvalidPlacement(format!(
                    "container {} belongs to pool {}, not {}",
                    info.fpg, info.pool, pool
                )));
            }
        }
        ctx.container = Some(info);
        Ok(())
    }
}

/// Resolve the pool's default container from allocation metadata
pub struct ResolveDefaultContainer(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for ResolveDefaultContainer {
    fn name(&self) -> &'static str {
        "resolve-default-container"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let Placement::PoolDefault { pool } = &ctx.placement else {
            return Err(Error::Internal(
                "resolve-default-container needs a pool placement".into(),
            ));
        };
        ctx.container = Some(self.0.planner.default_container(pool)?);
        Ok(())
    }
}

pub struct ReserveSlot(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for ReserveSlot {
    fn name(&self) -> &'static str {
        "reserve-slot"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        self.0.planner.reserve_slot(ctx.container()?)
    }

    async fn compensate(&self, ctx: &mut CreateContext) -> Result<()> {
        self.0.planner.release_slot(&ctx.container()?.fpg)
    }
}

pub struct CreateContainer(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for CreateContainer {
    fn name(&self) -> &'static str {
        "create-container"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let Placement::NewContainer { pool, fpg, vfs, .. } = &ctx.placement else {
            return Err(Error::Internal("create-container needs a new-container placement".into()));
        };
        info!(
            "Creating container {}/{} in pool {} on backend {}",
            fpg, vfs, pool, self.0.backend.name
        );
        let info = self
            .0
            .array
            .create_container(pool, fpg, vfs, self.0.backend.container_size_gib)
            .await?;
        ctx.container = Some(info);
        Ok(())
    }

    /// Deletes the container unless another share has taken a slot on it
    /// meanwhile.
    async fn compensate(&self, ctx: &mut CreateContext) -> Result<()> {
        let fpg = ctx.container()?.fpg.clone();
        if self.0.planner.container_in_use(&fpg)? {
            info!("Keeping container {}: other shares were placed on it", fpg);
            return Ok(());
        }
        self.0.array.delete_container(&fpg).await
    }
}

/// Record a freshly created container with the share's slot already taken
pub struct RegisterContainer(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for RegisterContainer {
    fn name(&self) -> &'static str {
        "register-container"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let make_default = matches!(
            ctx.placement,
            Placement::NewContainer {
                make_default: true,
                ..
            }
        );
        ctx.previous_default = self
            .0
            .planner
            .register_container(ctx.container()?, make_default)?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut CreateContext) -> Result<()> {
        let made_default = matches!(
            ctx.placement,
            Placement::NewContainer {
                make_default: true,
                ..
            }
        );
        self.0
            .planner
            .unregister_container(ctx.container()?, made_default, ctx.previous_default.clone())?;
        Ok(())
    }
}

pub struct CreateShare(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for CreateShare {
    fn name(&self) -> &'static str {
        "create-share"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let backend = &self.0.backend;
        let container = ctx.container()?.clone();
        let size_gib = ctx.request.size_gib.unwrap_or(backend.default_size_gib);
        let fstore = ctx.fstore().to_string();

        let backend_share_id = self
            .0
            .array
            .create_share(&container, &fstore, size_gib)
            .await?;

        let request = &ctx.request;
        ctx.record = Some(ShareRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: ctx.name.clone(),
            backend: backend.name.clone(),
            pool: container.pool,
            fpg: container.fpg,
            vfs: container.vfs,
            fstore,
            vfs_ips: container.vfs_ips,
            backend_share_id,
            protocol: request.protocol,
            share_dir: request.share_dir.clone(),
            readonly: request.readonly,
            protocol_opts: request.protocol_opts.clone(),
            size_gib,
            soft_quota_gib: request.soft_quota_gib.unwrap_or(0),
            hard_quota_gib: request.hard_quota_gib.unwrap_or(size_gib),
            allow_ips: request.allow_ips.clone(),
            deny_ips: request.deny_ips.clone(),
            comment: request.comment.clone().unwrap_or_default(),
            snapshots: Vec::new(),
            client_ips: Default::default(),
            mount_state: Default::default(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn compensate(&self, ctx: &mut CreateContext) -> Result<()> {
        let record = ctx.record()?.clone();
        self.0.array.delete_share(&record).await?;
        ctx.record = None;
        Ok(())
    }
}

pub struct SetQuota(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for SetQuota {
    fn name(&self) -> &'static str {
        "set-quota"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let record = ctx.record()?;
        let container = ctx.container()?;
        self.0
            .array
            .set_quota(&record.pool, container, &record.fstore, record.size_gib)
            .await
    }
}

pub struct PersistRecord(pub Arc<StepDeps>);

#[async_trait]
impl Step<CreateContext> for PersistRecord {
    fn name(&self) -> &'static str {
        "persist-record"
    }

    async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
        let record = ctx.record()?;
        match self.0.repo.insert_share(record) {
            Ok(()) => Ok(()),
            // never clean up a record another writer owns
            Err(e @ Error::AlreadyExists(_)) => Err(e),
            Err(e) => {
                if let Err(cleanup) = self.0.repo.delete_share(&record.name) {
                    warn!(
                        "Could not clear partial record of {}: {}",
                        record.name, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn compensate(&self, ctx: &mut CreateContext) -> Result<()> {
        self.0.repo.delete_share(&ctx.name)
    }
}

/// Pipeline for `placement`
pub fn create_pipeline(deps: &Arc<StepDeps>, placement: &Placement) -> Pipeline<CreateContext> {
    let pipeline = match placement {
        Placement::Explicit { .. } => Pipeline::new("create-on-existing-container")
            .step(LocateContainer(deps.clone()))
            .step(ReserveSlot(deps.clone())),
        Placement::PoolDefault { .. } => Pipeline::new("create-on-default-container")
            .step(ResolveDefaultContainer(deps.clone()))
            .step(ReserveSlot(deps.clone())),
        Placement::NewContainer { .. } => Pipeline::new("create-on-new-container")
            .step(CreateContainer(deps.clone()))
            .step(RegisterContainer(deps.clone())),
    };
    pipeline
        .step(CreateShare(deps.clone()))
        .step(SetQuota(deps.clone()))
        .step(PersistRecord(deps.clone()))
}

// === Delete ===

pub struct DeleteContext {
    pub record: ShareRecord,
}

pub struct DeleteArrayShare(pub Arc<StepDeps>);

#[async_trait]
impl Step<DeleteContext> for DeleteArrayShare {
    fn name(&self) -> &'static str {
        "delete-share"
    }

    async fn execute(&self, ctx: &mut DeleteContext) -> Result<()> {
        match self.0.array.delete_share(&ctx.record).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(what)) => {
                warn!(
                    "{} already gone from the array, removing {} anyway",
                    what, ctx.record.name
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Give the container slot back. Best-effort: a lost slot only lowers the
/// container's usable capacity, while the share itself is already gone.
pub struct ReleaseSlot(pub Arc<StepDeps>);

#[async_trait]
impl Step<DeleteContext> for ReleaseSlot {
    fn name(&self) -> &'static str {
        "release-slot"
    }

    async fn execute(&self, ctx: &mut DeleteContext) -> Result<()> {
        if let Err(e) = self.0.planner.release_slot(&ctx.record.fpg) {
            warn!(
                "Could not release slot of {} on {}: {}",
                ctx.record.name, ctx.record.fpg, e
            );
        }
        Ok(())
    }
}

pub struct DeleteRecord(pub Arc<StepDeps>);

#[async_trait]
impl Step<DeleteContext> for DeleteRecord {
    fn name(&self) -> &'static str {
        "delete-record"
    }

    async fn execute(&self, ctx: &mut DeleteContext) -> Result<()> {
        self.0.repo.delete_share(&ctx.record.name)
    }
}

pub fn delete_pipeline(deps: &Arc<StepDeps>) -> Pipeline<DeleteContext> {
    Pipeline::new("delete-share")
        .step(DeleteArrayShare(deps.clone()))
        .step(ReleaseSlot(deps.clone()))
        .step(DeleteRecord(deps.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KVStore, MemStore};
    use crate::provisioner::array::{ArrayOp, InMemoryArray};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        fail_undo: bool,
    }

    #[async_trait]
    impl Step<()> for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, _ctx: &mut ()) -> Result<()> {
            self.log.lock().unwrap().push(format!("do {}", self.name));
            if self.fail {
                return Err(Error::BackendCommunication(self.name.into()));
            }
            Ok(())
        }

        async fn compensate(&self, _ctx: &mut ()) -> Result<()> {
            self.log.lock().unwrap().push(format!("undo {}", self.name));
            if self.fail_undo {
                return Err(Error::Internal("undo failed".into()));
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
            fail: false,
            fail_undo: false,
        }
    }

    #[tokio::test]
    async fn test_rollback_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new("test")
            .step(recorder("a", &log))
            .step(Recorder {
                fail_undo: true,
                ..recorder("b", &log)
            })
            .step(recorder("c", &log))
            .step(Recorder {
                fail: true,
                ..recorder("d", &log)
            })
            .step(recorder("e", &log));

        let err = pipeline.run(&mut ()).await.unwrap_err();
        assert!(matches!(err, Error::BackendCommunication(ref s) if s == "d"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["do a", "do b", "do c", "do d", "undo c", "undo b", "undo a"]
        );
    }

    #[tokio::test]
    async fn test_success_runs_no_compensation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new("test")
            .step(recorder("a", &log))
            .step(recorder("b", &log));
        pipeline.run(&mut ()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["do a", "do b"]);
    }

    fn deps(array: Arc<InMemoryArray>) -> Arc<StepDeps> {
        let store: Arc<dyn KVStore> = Arc::new(MemStore::new());
        let repo = Arc::new(MetadataRepository::new(store));
        let mut backend = BackendConfig::new("DEFAULT");
        backend.default_pool = Some("cpg_a".into());
        repo.init_backend("DEFAULT", Some("cpg_a")).unwrap();
        let planner = Arc::new(AllocationPlanner::new(repo.clone(), backend.clone()));
        Arc::new(StepDeps {
            backend,
            repo,
            planner,
            array,
        })
    }

    fn new_container() -> Placement {
        Placement::NewContainer {
            pool: "cpg_a".into(),
            fpg: "fpg_cpg_a_1".into(),
            vfs: "vfs_cpg_a_1".into(),
            make_default: true,
        }
    }

    #[test]
    fn test_pipeline_composition() {
        let deps = deps(Arc::new(InMemoryArray::new()));
        let pipeline = create_pipeline(&deps, &new_container());
        assert_eq!(pipeline.label(), "create-on-new-container");
        assert_eq!(
            pipeline.step_names(),
            vec![
                "create-container",
                "register-container",
                "create-share",
                "set-quota",
                "persist-record"
            ]
        );
        assert_eq!(
            delete_pipeline(&deps).step_names(),
            vec!["delete-share", "release-slot", "delete-record"]
        );
    }

    #[tokio::test]
    async fn test_create_on_new_container() {
        let array = Arc::new(InMemoryArray::new());
        let deps = deps(array.clone());
        let placement = new_container();

        let mut ctx = CreateContext::new("alpha", CreateRequest::default(), placement.clone());
        create_pipeline(&deps, &placement).run(&mut ctx).await.unwrap();
        let record = ctx.into_record().unwrap();

        assert_eq!(record.fpg, "fpg_cpg_a_1");
        assert_eq!(record.size_gib, deps.backend.default_size_gib);
        assert!(array.has_container("fpg_cpg_a_1"));
        assert_eq!(deps.repo.require_share("alpha").unwrap(), record);
        assert_eq!(
            deps.planner.default_container("cpg_a").unwrap().fpg,
            "fpg_cpg_a_1"
        );
    }

    #[tokio::test]
    async fn test_quota_failure_rolls_back_everything() {
        let array = Arc::new(InMemoryArray::new());
        array.fail(ArrayOp::SetQuota);
        let deps = deps(array.clone());
        let placement = new_container();

        let mut ctx = CreateContext::new("alpha", CreateRequest::default(), placement.clone());
        let err = create_pipeline(&deps, &placement)
            .run(&mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendCommunication(_)));
        assert_eq!(array.calls(ArrayOp::DeleteShare), 1);
        assert_eq!(array.share_count(), 0);
        assert!(!array.has_container("fpg_cpg_a_1"));
        assert!(deps.repo.get_share("alpha").unwrap().is_none());

        let meta = deps.repo.get_backend("DEFAULT").unwrap().unwrap();
        assert!(meta.containers.is_empty());
        assert_eq!(meta.default_container("cpg_a"), None);
    }

    /// Takes a slot on the resolved container, as a concurrent create would
    struct ClaimSlot(Arc<StepDeps>);

    #[async_trait]
    impl Step<CreateContext> for ClaimSlot {
        fn name(&self) -> &'static str {
            "claim-slot"
        }

        async fn execute(&self, ctx: &mut CreateContext) -> Result<()> {
            self.0.planner.reserve_slot(ctx.container()?)
        }
    }

    #[tokio::test]
    async fn test_rollback_keeps_container_shared_by_another_share() {
        let array = Arc::new(InMemoryArray::new());
        array.fail(ArrayOp::SetQuota);
        let deps = deps(array.clone());
        let placement = new_container();

        let pipeline = Pipeline::new("create-on-new-container")
            .step(CreateContainer(deps.clone()))
            .step(RegisterContainer(deps.clone()))
            .step(ClaimSlot(deps.clone()))
            .step(CreateShare(deps.clone()))
            .step(SetQuota(deps.clone()));
        let mut ctx = CreateContext::new("alpha", CreateRequest::default(), placement);
        assert!(pipeline.run(&mut ctx).await.is_err());

        assert!(array.has_container("fpg_cpg_a_1"));
        assert_eq!(array.calls(ArrayOp::DeleteContainer), 0);
        let meta = deps.repo.get_backend("DEFAULT").unwrap().unwrap();
        assert_eq!(meta.containers["fpg_cpg_a_1"].share_count, 1);
        assert_eq!(meta.default_container("cpg_a"), Some("fpg_cpg_a_1"));
    }

    #[tokio::test]
    async fn test_existing_record_is_not_overwritten() {
        let array = Arc::new(InMemoryArray::new());
        let deps = deps(array.clone());
        let mut other = crate::provisioner::metadata::tests::sample_share("alpha");
        other.comment = "owned elsewhere".into();
        deps.repo.insert_share(&other).unwrap();

        let placement = new_container();
        let mut ctx = CreateContext::new("alpha", CreateRequest::default(), placement.clone());
        let err = create_pipeline(&deps, &placement)
            .run(&mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(
            deps.repo.require_share("alpha").unwrap().comment,
            "owned elsewhere"
        );
        assert_eq!(array.share_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_keeps_record_when_array_fails() {
        let array = Arc::new(InMemoryArray::new());
        let deps = deps(array.clone());
        let placement = new_container();
        let mut ctx = CreateContext::new("alpha", CreateRequest::default(), placement.clone());
        create_pipeline(&deps, &placement).run(&mut ctx).await.unwrap();
        let record = ctx.into_record().unwrap();

        array.fail(ArrayOp::DeleteShare);
        let mut del = DeleteContext {
            record: record.clone(),
        };
        assert!(delete_pipeline(&deps).run(&mut del).await.is_err());
        assert!(deps.repo.get_share("alpha").unwrap().is_some());

        array.heal(ArrayOp::DeleteShare);
        delete_pipeline(&deps).run(&mut del).await.unwrap();
        assert!(deps.repo.get_share("alpha").unwrap().is_none());
        let meta = deps.repo.get_backend("DEFAULT").unwrap().unwrap();
        assert_eq!(meta.containers["fpg_cpg_a_1"].share_count, 0);
    }
}
