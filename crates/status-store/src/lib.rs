//! Status Store: durable append-or-CAS state for Migration, ShardProgress,
//! Lock, and Event records (§4.8). All mutations are crash-atomic; readers
//! may see stale but never torn records. This is the single source of
//! truth on crash recovery -- a coordinator may be restarted at any time,
//! and another may take over a Migration by CAS-claiming its `owner_token`.

use async_trait::async_trait;
use models::{
    Event, Id, Lock, Migration, MigrationFilter, MigrationRequest, MigrationState, Resource,
    ShardProgress,
};
use std::time::Duration;

pub mod memory;
pub mod pg;

/// StatusError classifies why a Status Store operation did not apply,
/// distinct from the richer `ErrorClass` taxonomy the Orchestrator reasons
/// about -- a CAS mismatch here always becomes `ErrorClass::Contention`
/// once it crosses into `EngineError`.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("expected version {expected} for {id:?} but found {found}")]
    VersionMismatch { id: Id, expected: i64, found: i64 },
    #[error("no record found for {0:?}")]
    NotFound(Id),
    #[error("resource {resource} is held by another migration")]
    LockBusy { resource: Resource },
    #[error("fencing token {presented} is stale for {resource}; last accepted was {last}")]
    StaleFencingToken {
        resource: Resource,
        presented: i64,
        last: i64,
    },
    #[error("status store is unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StatusError {
    pub fn class(&self) -> models::ErrorClass {
        match self {
            StatusError::VersionMismatch { .. }
            | StatusError::LockBusy { .. }
            | StatusError::StaleFencingToken { .. } => models::ErrorClass::Contention,
            StatusError::NotFound(_) => models::ErrorClass::Logical,
            StatusError::Unavailable(_) => models::ErrorClass::Fatal,
            StatusError::Other(_) => models::ErrorClass::Logical,
        }
    }
}

/// StatusStore is the durable operation set the Orchestrator, Executors,
/// and Lock Manager mutate through. Two concrete back-ends are acceptable
/// with equivalent semantics (a relational store with row-level UPDATE and
/// a per-record version column; a document store with optimistic
/// concurrency on a version field) -- `pg::PgStatusStore` implements the
/// relational variant.
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    /// Persists both the live execution record and an immutable copy of the
    /// `MigrationRequest` it was admitted from -- a restarted coordinator,
    /// or a `start` call that only carries a migration id, needs the
    /// original request to re-derive a `Plan` (§6, §9).
    async fn create_migration(
        &self,
        migration: &Migration,
        request: &MigrationRequest,
    ) -> Result<(), StatusError>;

    async fn get_migration(&self, id: Id) -> Result<Option<Migration>, StatusError>;

    /// Returns the `MigrationRequest` a `Migration` was admitted from.
    async fn get_request(&self, migration_id: Id) -> Result<Option<MigrationRequest>, StatusError>;

    /// Lists migrations matching `filter`, most recently created first.
    async fn list_migrations(
        &self,
        filter: &MigrationFilter,
    ) -> Result<Vec<Migration>, StatusError>;

    /// Atomically transitions `id` from `expected_version` to `new_state`,
    /// incrementing the version. Rejects the write if the current version
    /// differs, or if `new_state` is not a legal transition from the
    /// stored state.
    async fn cas_migration_state(
        &self,
        id: Id,
        expected_version: i64,
        new_state: MigrationState,
    ) -> Result<Migration, StatusError>;

    /// Claims ownership of `id` for `owner_token`, for takeover by a new
    /// coordinator process after the prior owner disappeared.
    async fn claim_ownership(
        &self,
        id: Id,
        expected_version: i64,
        owner_token: i64,
    ) -> Result<Migration, StatusError>;

    /// Applies a monotonic delta to a `ShardProgress`'s `items_processed`
    /// and advances its `last_checkpoint`, creating the record if absent.
    /// `items_processed` never decreases, even under duplicate replay of
    /// the same delta (the caller is responsible for submitting each
    /// batch's delta exactly once from the Status Store's point of view,
    /// by gating the call on `apply_batch` having already durably
    /// committed; see §4.3 step 5).
    async fn upsert_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: models::ShardId,
        delta_items: u64,
        cursor: Option<&str>,
    ) -> Result<ShardProgress, StatusError>;

    async fn set_progress_status(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: models::ShardId,
        status: models::ShardProgressStatus,
        error: Option<&str>,
    ) -> Result<ShardProgress, StatusError>;

    async fn get_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: models::ShardId,
    ) -> Result<Option<ShardProgress>, StatusError>;

    async fn list_progress(&self, migration_id: Id) -> Result<Vec<ShardProgress>, StatusError>;

    async fn append_event(&self, event: &Event) -> Result<(), StatusError>;

    async fn list_events(&self, migration_id: Id) -> Result<Vec<Event>, StatusError>;

    /// Acquires a non-blocking lease over `resource` for `holder`. Returns
    /// `StatusError::LockBusy` if another live holder's lease has not yet
    /// expired.
    async fn acquire_lock(
        &self,
        resource: &Resource,
        holder: Id,
        ttl: Duration,
    ) -> Result<Lock, StatusError>;

    /// Renews `holder`'s lease, presenting the fencing token it last
    /// observed. Rejected if a newer token has since been issued for the
    /// same resource.
    async fn renew_lock(
        &self,
        resource: &Resource,
        holder: Id,
        fencing_token: i64,
        ttl: Duration,
    ) -> Result<Lock, StatusError>;

    async fn release_lock(&self, resource: &Resource, holder: Id) -> Result<(), StatusError>;

    /// Reaps locks whose holder Migration has reached a terminal state, or
    /// whose lease has expired past TTL plus grace. Returns the resources
    /// reclaimed.
    async fn reap_stale_locks(&self, grace: Duration) -> Result<Vec<Lock>, StatusError>;
}
