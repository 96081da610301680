//! Executor drives a single `Step` against a single shard to completion or
//! failure (§4.3): one per `(back-end, shard, step)`. Schema steps call
//! `apply_schema` once; data steps drive the Batch Pump to `END`,
//! transforming and applying each batch, advancing the Status Store
//! checkpoint only after the target has durably applied the batch.

use batch_pump::{BatchPump, BatchPumpConfig};
use exponential_backoff::Backoff;
use models::{Id, ShardId, ShardProgressStatus, Step, StepKind};
use status_store::{StatusError, StatusStore};
use std::sync::Arc;
use std::time::Duration;
use store_driver::{Conn, Record, SchemaOutcome, StoreDriver};
use tokio_util::sync::CancellationToken;
use transform::Registry;

/// Attempt schedule for Transient store-driver errors (§7): five retries,
/// exponential backoff from 100ms up to a 5s cap. Logical and structural
/// errors never reach this path -- only the driver's own `anyhow::Error`
/// (classified `Transient` by `ExecutorError::class`) is retried here.
fn transient_retry_schedule() -> Vec<Duration> {
    let backoff = Backoff::new(5, Duration::from_millis(100), Duration::from_secs(5));
    (&backoff).into_iter().flatten().collect()
}

async fn open_with_retry<D: StoreDriver + ?Sized>(
    driver: &D,
    shard: ShardId,
) -> anyhow::Result<Conn> {
    let schedule = transient_retry_schedule();
    let mut attempt = 0;
    loop {
        match driver.open(shard).await {
            Ok(conn) => return Ok(conn),
            Err(err) if attempt < schedule.len() => {
                tracing::warn!(?err, attempt, "transient error opening store connection, retrying");
                tokio::time::sleep(schedule[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn apply_schema_with_retry<D: StoreDriver + ?Sized>(
    driver: &D,
    payload_ref: &str,
    conn: &mut Conn,
) -> anyhow::Result<SchemaOutcome> {
    let schedule = transient_retry_schedule();
    let mut attempt = 0;
    loop {
        match driver.apply_schema(payload_ref, conn).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < schedule.len() => {
                tracing::warn!(?err, attempt, "transient error applying schema step, retrying");
                tokio::time::sleep(schedule[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn apply_batch_with_retry<D: StoreDriver + ?Sized>(
    driver: &D,
    records: Vec<Record>,
    conn: &mut Conn,
) -> anyhow::Result<usize> {
    let schedule = transient_retry_schedule();
    let mut attempt = 0;
    loop {
        match driver.apply_batch(records.clone(), conn).await {
            Ok(n) => return Ok(n),
            Err(err) if attempt < schedule.len() => {
                tracing::warn!(?err, attempt, "transient error applying batch, retrying");
                tokio::time::sleep(schedule[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Transform(#[from] transform::TransformError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn class(&self) -> models::ErrorClass {
        match self {
            ExecutorError::Transform(_) => models::ErrorClass::Logical,
            ExecutorError::Status(err) => err.class(),
            ExecutorError::Other(_) => models::ErrorClass::Transient,
        }
    }
}

pub struct StepExecutor<D: StoreDriver + ?Sized> {
    driver: Arc<D>,
    status: Arc<dyn StatusStore>,
    registry: Arc<Registry>,
    batch_config: BatchPumpConfig,
    batch_concurrency: Arc<tokio::sync::Semaphore>,
}

impl<D: StoreDriver + ?Sized> StepExecutor<D> {
    pub fn new(
        driver: Arc<D>,
        status: Arc<dyn StatusStore>,
        registry: Arc<Registry>,
        batch_config: BatchPumpConfig,
        batch_concurrency: Arc<tokio::sync::Semaphore>,
    ) -> Self {
        Self {
            driver,
            status,
            registry,
            batch_config,
            batch_concurrency,
        }
    }

    /// Drives `step` to completion, failure, or cancellation. Returns
    /// `Ok(())` for `completed` and `skipped` outcomes; any other outcome
    /// is surfaced as a typed `ExecutorError` for the Orchestrator to
    /// classify (§7).
    #[tracing::instrument(skip(self, cancel), fields(migration_id = %migration_id, step = %step.id))]
    pub async fn run(
        &self,
        migration_id: Id,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let existing = self
            .status
            .get_progress(migration_id, &step.id.step_id, step.id.shard)
            .await?;

        if let Some(progress) = &existing {
            if progress.is_complete_or_skipped() {
                return Ok(());
            }
        }

        let mut conn = open_with_retry(&*self.driver, step.id.shard).await?;

        let result = match step.kind {
            StepKind::Schema => self.run_schema(migration_id, step, &mut conn).await,
            StepKind::Data => {
                let resume_cursor = existing.and_then(|p| p.last_checkpoint);
                self.run_data(migration_id, step, resume_cursor, &mut conn, cancel)
                    .await
            }
        };

        match &result {
            Ok(()) => {
                self.status
                    .set_progress_status(
                        migration_id,
                        &step.id.step_id,
                        step.id.shard,
                        ShardProgressStatus::Completed,
                        None,
                    )
                    .await?;
            }
            Err(err) => {
                self.status
                    .set_progress_status(
                        migration_id,
                        &step.id.step_id,
                        step.id.shard,
                        ShardProgressStatus::Failed,
                        Some(&err.to_string()),
                    )
                    .await?;
            }
        }

        result
    }

    #[tracing::instrument(skip(self, conn))]
    async fn run_schema(
        &self,
        migration_id: Id,
        step: &Step,
        conn: &mut Conn,
    ) -> Result<(), ExecutorError> {
        self.status
            .set_progress_status(
                migration_id,
                &step.id.step_id,
                step.id.shard,
                ShardProgressStatus::Running,
                None,
            )
            .await?;

        let outcome = apply_schema_with_retry(&*self.driver, &step.payload_ref, conn).await?;
        if outcome == SchemaOutcome::AlreadyApplied {
            tracing::info!("schema step already applied, treating as success");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, conn, cancel))]
    async fn run_data(
        &self,
        migration_id: Id,
        step: &Step,
        resume_cursor: Option<String>,
        conn: &mut Conn,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut pump = BatchPump::new(self.batch_config, self.batch_concurrency.clone());
        let mut cursor = resume_cursor;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("cancellation observed at batch boundary, stopping cleanly");
                return Ok(());
            }

            let batch = pump.next_batch(&*self.driver, cursor.as_deref(), conn).await?;

            let mut transformed = Vec::with_capacity(batch.records.len());
            for record in &batch.records {
                match self.registry.apply(&step.payload_ref, record) {
                    Ok(Some(transformed_record)) => transformed.push(transformed_record),
                    Ok(None) => {} // Dropped by the transformer.
                    Err(err) => return Err(err.into()),
                }
            }

            self.driver.begin(conn).await?;
            let applied = match apply_batch_with_retry(&*self.driver, transformed, conn).await {
                Ok(n) => n,
                Err(err) => {
                    self.driver.rollback(conn).await.ok();
                    return Err(err.into());
                }
            };
            self.driver.commit(conn).await?;

            // The checkpoint only advances once the batch is durable at the
            // target, per the commit-ordering invariant in §4.3 step 5.
            self.status
                .upsert_progress(
                    migration_id,
                    &step.id.step_id,
                    step.id.shard,
                    applied as u64,
                    batch.next_cursor.as_deref(),
                )
                .await?;

            if batch.next_cursor.is_none() {
                return Ok(());
            }
            cursor = batch.next_cursor;
        }
    }
}
