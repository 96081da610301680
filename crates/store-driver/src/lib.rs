//! StoreDriver is the capability contract each back-end must satisfy (§4.2).
//! Writing the actual SQL or document-store driver calls is out of scope
//! (§1) -- this crate only fixes the shape every back-end presents to the
//! Executor, plus an in-memory reference implementation used by tests
//! throughout the workspace.
//!
//! Re-architected per §9: a single `StoreDriver` capability with (in a real
//! deployment) two concrete variants, rather than the source's base-class
//! inheritance. The Orchestrator holds one boxed instance per store class,
//! obtained from configuration.

use async_trait::async_trait;
use models::ShardId;
use std::any::Any;

pub mod memory;

/// Health as reported by a back-end connection; drives Batch Pump backoff
/// (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    #[default]
    Ok,
    Degraded,
    Down,
}

/// SchemaOutcome distinguishes a freshly-applied schema step from one the
/// back-end recognizes as already applied via its native marker (a
/// `migrations` table row, a sentinel collection document). Both are
/// treated as success by the Executor (§4.3 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    Applied,
    AlreadyApplied,
}

/// A single source record read by `stream_batch`, keyed by a stable id so
/// that `apply_batch` can upsert idempotently under duplicate replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub fields: serde_json::Value,
}

/// Batch is the result of one `stream_batch` call. `next_cursor` is `None`
/// exactly when the source is exhausted (the `END` sentinel in §4.2).
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
}

/// Conn is an opaque, type-erased handle to a back-end connection acquired
/// by `StoreDriver::open`. Concrete drivers downcast it back to their own
/// connection type; callers never inspect it.
pub struct Conn(Box<dyn Any + Send>);

impl Conn {
    pub fn new<T: Send + 'static>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_mut<T: Send + 'static>(&mut self) -> anyhow::Result<&mut T> {
        self.0
            .downcast_mut::<T>()
            .ok_or_else(|| anyhow::anyhow!("connection handle is not of the expected type"))
    }
}

/// StoreDriver is the capability the engine requires from each back-end
/// (§4.2). Implementations must make `apply_schema` idempotent and
/// `apply_batch` internally atomic for back-ends lacking multi-statement
/// transactions.
#[async_trait]
pub trait StoreDriver: Send + Sync + 'static {
    /// Acquires and health-checks a connection to `shard`.
    async fn open(&self, shard: ShardId) -> anyhow::Result<Conn>;

    /// Applies a schema step. Idempotent: safe to retry after a partial
    /// crash, and must detect prior application via a back-end-native
    /// marker rather than re-deriving it from side effects.
    async fn apply_schema(&self, step: &str, conn: &mut Conn) -> anyhow::Result<SchemaOutcome>;

    /// Reads up to `size` records starting after `cursor` (`None` for the
    /// start of the stream). Snapshot-consistent for the batch; the cursor
    /// returned is opaque and shard-local.
    async fn stream_batch(
        &self,
        cursor: Option<&str>,
        size: usize,
        conn: &mut Conn,
    ) -> anyhow::Result<Batch>;

    /// Applies transformed records, all-or-nothing within the batch.
    /// Returns the count actually applied.
    async fn apply_batch(&self, records: Vec<Record>, conn: &mut Conn) -> anyhow::Result<usize>;

    /// Begins a multi-statement transaction where the back-end supports
    /// one; a no-op otherwise (in which case `apply_batch` alone must be
    /// atomic).
    async fn begin(&self, conn: &mut Conn) -> anyhow::Result<()>;
    async fn commit(&self, conn: &mut Conn) -> anyhow::Result<()>;
    async fn rollback(&self, conn: &mut Conn) -> anyhow::Result<()>;

    /// Reports connection health, consulted by the Batch Pump's adaptive
    /// sizing control loop (§4.4).
    async fn health(&self, conn: &mut Conn) -> anyhow::Result<Health>;
}
