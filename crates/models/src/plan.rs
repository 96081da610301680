use crate::{Id, ShardId, StepKind, StoreClass, TopologyVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// StepId identifies a single expanded `Step` within a `Plan`: the request's
/// named step, expanded onto one concrete shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub step_id: String,
    pub shard: ShardId,
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.step_id, self.shard)
    }
}

/// Step is a single schema or data operation against one shard, placed in a
/// stage of the Plan's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    pub payload_ref: String,
    pub dependencies: BTreeSet<StepId>,
    pub estimated_items: Option<u64>,
}

/// Plan is the materialized DAG of Steps derived from a `MigrationRequest`
/// plus the `Topology` snapshot current at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub request_id: Id,
    pub store_class: StoreClass,
    pub topology_version: TopologyVersion,
    /// Steps grouped into stages by topological level. All steps of stage N
    /// complete before any step of stage N+1 starts; steps within a stage
    /// have no dependency on one another and may run in parallel.
    pub stages: Vec<Stage>,
    /// Stable hash of plan structure, used to detect that a stored Plan no
    /// longer matches what replanning would produce.
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    pub fn find(&self, id: &StepId) -> Option<&Step> {
        self.steps().find(|s| &s.id == id)
    }
}
