use crate::{Id, ShardId, StoreClass};
use serde::{Deserialize, Serialize};

/// StepKind distinguishes a schema change from a streaming data transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Schema,
    Data,
}

/// StepScope names how many shards a requested step applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepScope {
    /// The step is expanded into one sub-step per shard current at plan time.
    AllShards,
    /// The step targets exactly one shard, selected by a routing key.
    SingleShard { routing_key: String },
}

/// RequestStep is the caller-supplied description of a single schema or data
/// operation, prior to DAG construction by the Planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    /// Stable identifier for this step, unique within the request.
    pub step_id: String,
    pub kind: StepKind,
    pub scope: StepScope,
    /// Identifies the schema change or registered transformer to apply.
    /// Resolved against the schema-step registry or transformer registry
    /// at plan time.
    pub payload_ref: String,
    /// step_ids, within this same request, that must complete first.
    pub depends_on: Vec<String>,
    /// Advisory estimate of total items this step will touch, used by the
    /// Orchestrator to bias scheduling toward the longest critical path.
    pub estimated_items: Option<u64>,
}

/// MigrationRequest is the caller-supplied unit of work admitted by the
/// engine. It is immutable once admitted; all mutable execution state lives
/// in the `Migration` record the Orchestrator opens for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub request_id: Id,
    pub name: String,
    pub store_class: StoreClass,
    pub steps: Vec<RequestStep>,
    /// Other MigrationRequests (by id) that must reach `completed` before
    /// this request may be admitted into planning.
    pub depends_on: Vec<Id>,
    pub concurrency_hint: ConcurrencyHint,
    /// Caller-supplied key used to detect duplicate submission of what is
    /// logically the same request.
    pub idempotency_key: String,
    pub rollback_policy: RollbackPolicy,
    /// Probes the Validator should run in its cross-shard phase. Absence
    /// means the engine falls back to per-shard post-checks only.
    pub cross_shard_probes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyHint {
    pub per_store_class_parallelism: Option<u32>,
}

impl Default for ConcurrencyHint {
    fn default() -> Self {
        Self {
            per_store_class_parallelism: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    Compensate,
    Halt,
}

/// ShardKey is the value a `SingleShard` step's routing key resolves to,
/// via `Topology::route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedShard(pub ShardId);
