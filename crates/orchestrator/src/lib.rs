//! Orchestrator: the central state machine driving a `Migration` through
//! planning, staged execution, validation, and rollback (§4.6). One
//! `Orchestrator<D>` is constructed per store class, holding the single
//! `StoreDriver` configured for it (§9's "a single `StoreDriver` capability
//! with two concrete variants; the Orchestrator holds one instance per
//! store class from configuration").

pub mod executor;

use executor::StepExecutor;
use models::{
    ConcurrencyHint, EngineError, Event, EventKind, Id, IdGenerator, Migration, MigrationRequest,
    MigrationState, Plan, Resource, RollbackPolicy, ShardId, ShardProgressStatus,
};
use planner::PlanError;
use status_store::{StatusError, StatusStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store_driver::StoreDriver;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use topology::Topology;
use transform::Registry;
use validator::{ValidationError, Validator};

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_CONTENTION_WINDOW: Duration = Duration::from_secs(10);

impl From<StatusError> for EngineError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::Unavailable(msg) => EngineError::StatusStoreUnavailable(msg),
            StatusError::LockBusy { resource } => EngineError::LockBusy {
                resource: resource.to_string(),
            },
            other => EngineError::Other(other.into()),
        }
    }
}

impl From<lockmgr::LockError> for EngineError {
    fn from(err: lockmgr::LockError) -> Self {
        match err {
            lockmgr::LockError::Busy { resource } => EngineError::LockBusy {
                resource: resource.to_string(),
            },
            lockmgr::LockError::Unavailable { resource } => EngineError::LockUnavailable {
                resource: resource.to_string(),
            },
            lockmgr::LockError::Status(err) => err.into(),
        }
    }
}

impl From<PlanError> for EngineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Cycle { step_id } => EngineError::PlanCycle { step_id },
            PlanError::UnknownDependency { step_id, .. } => EngineError::PlanCycle { step_id },
            PlanError::Topology(err) => EngineError::Other(err),
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        EngineError::Step {
            class: err.class(),
            step_id: "validation".to_string(),
            shard: "*".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<executor::ExecutorError> for EngineError {
    fn from(err: executor::ExecutorError) -> Self {
        EngineError::Step {
            class: err.class(),
            step_id: String::new(),
            shard: String::new(),
            message: err.to_string(),
        }
    }
}

/// ShardSemaphores hands out a lazily-created, capacity-1 semaphore per
/// shard, implementing the fixed `per_shard_parallelism=1` bound from §4.6.
#[derive(Default)]
struct ShardSemaphores {
    by_shard: Mutex<HashMap<ShardId, Arc<Semaphore>>>,
}

impl ShardSemaphores {
    async fn get(&self, shard: ShardId) -> Arc<Semaphore> {
        let mut map = self.by_shard.lock().await;
        map.entry(shard).or_insert_with(|| Arc::new(Semaphore::new(1))).clone()
    }
}

pub struct Orchestrator<D: StoreDriver + ?Sized> {
    driver: Arc<D>,
    status: Arc<dyn StatusStore>,
    topology: Arc<Topology>,
    locks: Arc<lockmgr::LockManager>,
    validator: Arc<Validator>,
    registry: Arc<Registry>,
    batch_config: batch_pump::BatchPumpConfig,
    /// Bounds how many Executors this store class runs concurrently.
    dispatch_permits: Arc<Semaphore>,
    /// Bounds in-flight Batch Pump batches across all shards of this store
    /// class; deliberately a separate pool from `dispatch_permits` so an
    /// Executor holding a dispatch permit is never starved waiting on the
    /// very pool that would also need to free its own permit (§4.4, §4.6).
    batch_permits: Arc<Semaphore>,
    shard_permits: Arc<ShardSemaphores>,
    id_gen: Mutex<IdGenerator>,
    cancellations: Mutex<HashMap<Id, CancellationToken>>,
}

impl<D: StoreDriver + ?Sized> Orchestrator<D> {
    pub fn new(
        driver: Arc<D>,
        status: Arc<dyn StatusStore>,
        topology: Arc<Topology>,
        locks: Arc<lockmgr::LockManager>,
        validator: Arc<Validator>,
        registry: Arc<Registry>,
        batch_config: batch_pump::BatchPumpConfig,
        per_store_class_parallelism: usize,
        batch_concurrency: usize,
        coordinator_shard: u16,
    ) -> Self {
        Self {
            driver,
            status,
            topology,
            locks,
            validator,
            registry,
            batch_config,
            dispatch_permits: Arc::new(Semaphore::new(per_store_class_parallelism)),
            batch_permits: Arc::new(Semaphore::new(batch_concurrency)),
            shard_permits: Arc::new(ShardSemaphores::default()),
            id_gen: Mutex::new(IdGenerator::new(coordinator_shard)),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Admits `request`: `created -> planning -> pending`. Persists the
    /// computed `Plan` digest on the `Migration` record and emits `created`.
    /// Does not start execution; callers invoke `start` separately (§6).
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn create_migration(&self, request: MigrationRequest) -> Result<Id, EngineError> {
        let migration_id = self.id_gen.lock().await.next();

        let migration = Migration {
            id: migration_id,
            request_id: request.request_id,
            plan_digest: None,
            state: MigrationState::Created,
            current_stage: None,
            created_at: now(),
            started_at: None,
            ended_at: None,
            items_processed: 0,
            final_outcome: None,
            last_error: None,
            version: 0,
            owner_token: 0,
            unrecoverable_steps: Vec::new(),
        };
        self.status.create_migration(&migration, &request).await?;
        self.emit(migration_id, EventKind::Created, serde_json::json!({}))
            .await;

        let migration = self
            .status
            .cas_migration_state(migration_id, migration.version, MigrationState::Planning)
            .await?;

        let plan = planner::plan(&request, &self.topology).await?;

        self.persist_plan(migration_id, migration.version, &plan, &request)
            .await?;

        Ok(migration_id)
    }

    async fn persist_plan(
        &self,
        migration_id: Id,
        version: i64,
        plan: &Plan,
        request: &MigrationRequest,
    ) -> Result<(), EngineError> {
        self.validator.check_plan_reachable(plan)?;
        self.validator.pre_check(
            &request.steps,
            &self.registry,
            matches!(request.rollback_policy, RollbackPolicy::Compensate),
        )?;

        self.status
            .cas_migration_state(migration_id, version, MigrationState::Pending)
            .await?;
        tracing::info!(digest = %plan.digest, "plan admitted");
        Ok(())
    }

    /// Drives `migration_id` from `pending` through to a terminal state:
    /// acquires shard leases, runs pre-validation, executes every stage in
    /// order, validates, and commits or rolls back (§4.6). Re-derives its
    /// `Plan` from the `MigrationRequest` persisted at `create_migration`,
    /// so a caller -- or a coordinator resuming after a restart -- needs
    /// only the migration id (§6's `start(id)`).
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, migration_id: Id) -> Result<MigrationState, EngineError> {
        let cancel = self.cancellation_token(migration_id).await;

        let migration = self
            .status
            .get_migration(migration_id)
            .await?
            .ok_or(StatusError::NotFound(migration_id))?;
        let request = self
            .status
            .get_request(migration_id)
            .await?
            .ok_or(StatusError::NotFound(migration_id))?;

        let plan = planner::plan(&request, &self.topology).await?;
        let dispatch_permits = dispatch_permits_for(&request.concurrency_hint, self.dispatch_permits.clone());

        let shards: Vec<ShardId> = plan
            .steps()
            .map(|s| s.id.shard)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut held_locks = Vec::with_capacity(shards.len());
        for shard in &shards {
            let resource = Resource::Shard {
                store_class: request.store_class.to_string(),
                shard: shard.0,
            };
            let handle = self
                .locks
                .acquire(resource, migration_id, DEFAULT_LOCK_TTL, DEFAULT_CONTENTION_WINDOW)
                .await?;
            held_locks.push(handle);
        }

        let migration = self
            .status
            .cas_migration_state(migration_id, migration.version, MigrationState::Running)
            .await?;
        self.emit(migration_id, EventKind::Started, serde_json::json!({}))
            .await;

        let run_result = self
            .run_stages(migration_id, &plan, &dispatch_permits, &cancel)
            .await;

        let outcome = match run_result {
            Ok(()) if cancel.is_cancelled() => {
                self.finish_cancelled(migration_id, migration.version + 1).await?
            }
            Ok(()) => {
                self.validate_and_complete(migration_id, migration.version + 1, &plan, &request)
                    .await?
            }
            Err(err) => {
                self.fail_and_maybe_rollback(
                    migration_id,
                    migration.version + 1,
                    &plan,
                    &request,
                    &err,
                )
                .await?
            }
        };

        for handle in &held_locks {
            if outcome != MigrationState::Failed {
                handle.release().await.ok();
            }
        }
        self.cancellations.lock().await.remove(&migration_id);

        Ok(outcome)
    }

    /// Signals cooperative cancellation (§5): in-flight Executors finish
    /// their current batch, then the Orchestrator stops dispatching.
    pub async fn cancel(&self, migration_id: Id) {
        let token = self.cancellation_token(migration_id).await;
        token.cancel();
    }

    async fn cancellation_token(&self, migration_id: Id) -> CancellationToken {
        self.cancellations
            .lock()
            .await
            .entry(migration_id)
            .or_default()
            .clone()
    }

    /// Runs every stage of `plan` to completion, stage by stage (a barrier
    /// between stages per §5's ordering guarantee); steps within a stage
    /// are dispatched concurrently, bounded by `dispatch_permits` and by
    /// each step's per-shard permit.
    async fn run_stages(
        &self,
        migration_id: Id,
        plan: &Plan,
        dispatch_permits: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let step_executor = StepExecutor::new(
            self.driver.clone(),
            self.status.clone(),
            self.registry.clone(),
            self.batch_config,
            self.batch_permits.clone(),
        );

        for stage in &plan.stages {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let results = futures::future::join_all(stage.steps.iter().map(|step| {
                self.run_one_step(migration_id, step, &step_executor, dispatch_permits, cancel)
            }))
            .await;

            if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Dispatches a single step: waits for a global dispatch permit and its
    /// shard's exclusive permit (`per_shard_parallelism = 1`), then drives
    /// the Executor and emits its lifecycle events.
    async fn run_one_step(
        &self,
        migration_id: Id,
        step: &models::Step,
        step_executor: &StepExecutor<D>,
        dispatch_permits: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let _dispatch_permit = dispatch_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| EngineError::Other(err.into()))?;
        let shard_semaphore = self.shard_permits.get(step.id.shard).await;
        let _shard_permit = shard_semaphore
            .acquire_owned()
            .await
            .map_err(|err| EngineError::Other(err.into()))?;

        self.emit(
            migration_id,
            EventKind::StepStarted,
            serde_json::json!({"step": step.id.to_string()}),
        )
        .await;

        match step_executor.run(migration_id, step, cancel).await {
            Ok(()) => {
                self.emit(
                    migration_id,
                    EventKind::StepCompleted,
                    serde_json::json!({"step": step.id.to_string()}),
                )
                .await;
                Ok(())
            }
            Err(err) => {
                self.emit(
                    migration_id,
                    EventKind::StepFailed,
                    serde_json::json!({"step": step.id.to_string(), "error": err.to_string()}),
                )
                .await;
                Err(EngineError::Step {
                    class: err.class(),
                    step_id: step.id.step_id.clone(),
                    shard: step.id.shard.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn validate_and_complete(
        &self,
        migration_id: Id,
        version: i64,
        plan: &Plan,
        request: &MigrationRequest,
    ) -> Result<MigrationState, EngineError> {
        let migration = self
            .status
            .cas_migration_state(migration_id, version, MigrationState::Validating)
            .await?;

        let probe_result = self.run_cross_shard_validation(request, plan).await;

        match probe_result {
            Ok(()) => {
                self.status
                    .cas_migration_state(migration_id, migration.version, MigrationState::Completed)
                    .await?;
                self.emit(migration_id, EventKind::Completed, serde_json::json!({}))
                    .await;
                Ok(MigrationState::Completed)
            }
            Err(err) => {
                self.emit(
                    migration_id,
                    EventKind::ValidationFailed,
                    serde_json::json!({"error": err.to_string()}),
                )
                .await;
                self.fail_and_maybe_rollback(migration_id, migration.version, plan, request, &err)
                    .await
            }
        }
    }

    async fn run_cross_shard_validation(
        &self,
        request: &MigrationRequest,
        plan: &Plan,
    ) -> Result<(), EngineError> {
        if request.cross_shard_probes.is_empty() {
            return Ok(());
        }
        let shards: Vec<ShardId> = plan
            .steps()
            .map(|s| s.id.shard)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut conns = Vec::with_capacity(shards.len());
        for shard in shards {
            let conn = self
                .driver
                .open(shard)
                .await
                .map_err(EngineError::Other)?;
            conns.push((shard, conn));
        }

        self.validator
            .cross_shard_check(&*self.driver, &mut conns, &request.cross_shard_probes)
            .await?;
        Ok(())
    }

    async fn finish_cancelled(&self, migration_id: Id, version: i64) -> Result<MigrationState, EngineError> {
        self.status
            .cas_migration_state(migration_id, version, MigrationState::Cancelling)
            .await?;
        let migration = self
            .status
            .cas_migration_state(migration_id, version + 1, MigrationState::Cancelled)
            .await?;
        let _ = migration.version;
        self.emit(migration_id, EventKind::Cancelled, serde_json::json!({}))
            .await;
        Ok(MigrationState::Cancelled)
    }

    /// Transitions `running|validating -> failing` and, per
    /// `rollback_policy`, either attempts compensation (`-> rolling_back`)
    /// or halts directly (`-> failed`). A step without a registered inverse
    /// leaves the Migration `failed` with `unrecoverable_steps` populated
    /// and its locks retained for operator acknowledgement (§4.6).
    async fn fail_and_maybe_rollback(
        &self,
        migration_id: Id,
        version: i64,
        plan: &Plan,
        request: &MigrationRequest,
        cause: &EngineError,
    ) -> Result<MigrationState, EngineError> {
        tracing::warn!(?cause, "migration failing");
        let migration = self
            .status
            .cas_migration_state(migration_id, version, MigrationState::Failing)
            .await?;

        if !matches!(request.rollback_policy, RollbackPolicy::Compensate) {
            self.status
                .cas_migration_state(migration_id, migration.version, MigrationState::Failed)
                .await?;
            self.emit(
                migration_id,
                EventKind::Failed,
                serde_json::json!({"error": cause.to_string()}),
            )
            .await;
            return Ok(MigrationState::Failed);
        }

        let migration = self
            .status
            .cas_migration_state(migration_id, migration.version, MigrationState::RollingBack)
            .await?;

        let unrecoverable = self.rollback(migration_id, plan).await?;

        if unrecoverable.is_empty() {
            self.status
                .cas_migration_state(migration_id, migration.version, MigrationState::RolledBack)
                .await?;
            self.emit(migration_id, EventKind::RolledBack, serde_json::json!({}))
                .await;
            Ok(MigrationState::RolledBack)
        } else {
            self.status
                .cas_migration_state(migration_id, migration.version, MigrationState::Failed)
                .await?;
            self.emit(
                migration_id,
                EventKind::Failed,
                serde_json::json!({"unrecoverable_steps": unrecoverable}),
            )
            .await;
            Ok(MigrationState::Failed)
        }
    }

    /// Invokes compensation for every completed step, in reverse completion
    /// order. Data steps compensate via the registered inverse transformer;
    /// schema steps have no generic down-migration available to this engine
    /// (store-native, out of scope per §1) and are always reported
    /// unrecoverable. Returns the step ids that could not be compensated.
    async fn rollback(&self, migration_id: Id, plan: &Plan) -> Result<Vec<String>, EngineError> {
        let mut unrecoverable = Vec::new();
        let progress = self.status.list_progress(migration_id).await?;
        let mut completed: Vec<_> = progress
            .into_iter()
            .filter(|p| p.status == ShardProgressStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        for record in completed {
            let Some(step) = plan.find(&models::StepId {
                step_id: record.step_id.clone(),
                shard: record.shard,
            }) else {
                continue;
            };

            match step.kind {
                models::StepKind::Schema => {
                    unrecoverable.push(step.id.to_string());
                }
                models::StepKind::Data => {
                    if !self.registry.has_inverse(&step.payload_ref) {
                        unrecoverable.push(step.id.to_string());
                        continue;
                    }
                    if let Err(err) = self.compensate_data_step(step).await {
                        tracing::error!(?err, step = %step.id, "compensation failed");
                        unrecoverable.push(step.id.to_string());
                    }
                }
            }
        }
        Ok(unrecoverable)
    }

    async fn compensate_data_step(&self, step: &models::Step) -> anyhow::Result<()> {
        let mut conn = self.driver.open(step.id.shard).await?;
        let records = validator::drain_all(&*self.driver, &mut conn).await?;

        let mut inverted = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(record) = self
                .registry
                .apply_inverse(&step.payload_ref, record)
                .map_err(|err| anyhow::anyhow!(err.to_string()))?
            {
                inverted.push(record);
            }
        }

        self.driver.begin(&mut conn).await?;
        if let Err(err) = self.driver.apply_batch(inverted, &mut conn).await {
            self.driver.rollback(&mut conn).await.ok();
            return Err(err);
        }
        self.driver.commit(&mut conn).await?;
        Ok(())
    }

    async fn emit(&self, migration_id: Id, kind: EventKind, payload: serde_json::Value) {
        let event = Event {
            id: self.id_gen.lock().await.next(),
            migration_id,
            kind,
            timestamp: now(),
            payload,
        };
        if let Err(err) = self.status.append_event(&event).await {
            tracing::warn!(?err, ?kind, "failed to append event");
        }
    }
}

fn dispatch_permits_for(hint: &ConcurrencyHint, default: Arc<Semaphore>) -> Arc<Semaphore> {
    match hint.per_store_class_parallelism {
        Some(n) => Arc::new(Semaphore::new(n as usize)),
        None => default,
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
