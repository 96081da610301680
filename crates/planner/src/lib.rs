//! Planner builds a `Plan` DAG from a `MigrationRequest` and the current
//! `Topology` (§4.5): dependency grouping, topological ordering into
//! stages, shard expansion, cycle detection, and an advisory cost
//! estimate.

use models::{
    MigrationRequest, Plan, RequestStep, Stage, Step, StepId, StepKind, StepScope, StoreClass,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use topology::Topology;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains a dependency cycle reachable from step {step_id:?}")]
    Cycle { step_id: String },
    #[error("step {step_id:?} declares a dependency on unknown step {depends_on:?}")]
    UnknownDependency { step_id: String, depends_on: String },
    #[error(transparent)]
    Topology(#[from] anyhow::Error),
}

/// Builds a `Plan` for `request` against `topology`'s current snapshot.
/// Cyclic dependencies are rejected before any shard expansion is
/// performed, per §4.5.
#[tracing::instrument(skip(request, topology), fields(request_id = %request.request_id))]
pub async fn plan(request: &MigrationRequest, topology: &Topology) -> Result<Plan, PlanError> {
    detect_cycle(&request.steps)?;

    let (topology_version, shards) = topology.shards_of(request.store_class);

    let expanded = expand_steps(&request.steps, request.store_class, topology)?;

    let stages = layer_into_stages(&expanded)?;
    let digest = digest_of(&request.request_id.to_string(), &stages);

    tracing::info!(
        shards = shards.len(),
        steps = expanded.len(),
        stages = stages.len(),
        "plan built"
    );

    Ok(Plan {
        request_id: request.request_id,
        store_class: request.store_class,
        topology_version,
        stages,
        digest,
    })
}

/// Kahn's-algorithm cycle check over the *request-level* step graph, before
/// any shard expansion -- a cycle at this level is always a cycle after
/// expansion too, and failing fast here avoids wasted topology calls.
fn detect_cycle(steps: &[RequestStep]) -> Result<(), PlanError> {
    let by_id: BTreeMap<&str, &RequestStep> =
        steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

    for step in steps {
        for dep in &step.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step_id: step.step_id.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
    }

    let mut in_degree: BTreeMap<&str, usize> =
        steps.iter().map(|s| (s.step_id.as_str(), 0)).collect();
    for step in steps {
        for _dep in &step.depends_on {
            *in_degree.get_mut(step.step_id.as_str()).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;
    let mut remaining = in_degree.clone();

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for step in steps {
            if step.depends_on.iter().any(|d| d == id) {
                let entry = remaining.get_mut(step.step_id.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(step.step_id.as_str());
                }
            }
        }
    }

    if visited != steps.len() {
        let step_id = steps
            .iter()
            .find(|s| remaining.get(s.step_id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.step_id.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        return Err(PlanError::Cycle { step_id });
    }

    Ok(())
}

/// ExpandedStep is an intermediate form before stage layering: a concrete
/// `Step` plus the dependencies inherited from its parent `RequestStep`.
struct ExpandedStep {
    step: Step,
}

fn expand_steps(
    steps: &[RequestStep],
    store_class: StoreClass,
    topology: &Topology,
) -> Result<Vec<ExpandedStep>, PlanError> {
    let (_version, all_shards) = topology.shards_of(store_class);

    // For each request step, the set of concrete StepIds it expands to.
    let mut expansions: BTreeMap<&str, Vec<StepId>> = BTreeMap::new();
    let mut out = Vec::new();

    for step in steps {
        let shards = match &step.scope {
            StepScope::AllShards => all_shards.clone(),
            StepScope::SingleShard { routing_key } => {
                vec![topology.route(routing_key, store_class)?]
            }
        };

        let ids: Vec<StepId> = shards
            .iter()
            .map(|shard| StepId {
                step_id: step.step_id.clone(),
                shard: *shard,
            })
            .collect();
        expansions.insert(step.step_id.as_str(), ids.clone());

        for (shard, id) in shards.iter().zip(ids.iter()) {
            out.push(ExpandedStep {
                step: Step {
                    id: id.clone(),
                    kind: step.kind,
                    payload_ref: step.payload_ref.clone(),
                    // Filled in below once every step's expansion is known.
                    dependencies: BTreeSet::new(),
                    estimated_items: step
                        .estimated_items
                        .map(|n| n / shard_divisor(&step.scope, *shard, &all_shards)),
                },
            });
        }
    }

    // Wire dependencies: a data step depending on an all-shards schema step
    // depends on every one of its shard expansions, since the invariant in
    // §4.5 is "completed on every shard it targets"; a step depending on a
    // single-shard step depends on that one expansion only.
    for step in steps {
        let deps: Vec<StepId> = step
            .depends_on
            .iter()
            .flat_map(|dep_id| expansions.get(dep_id.as_str()).cloned().unwrap_or_default())
            .collect();

        for expanded in out.iter_mut() {
            if expanded.step.id.step_id == step.step_id {
                expanded.step.dependencies.extend(deps.clone());
            }
        }
    }

    Ok(out)
}

fn shard_divisor(scope: &StepScope, _shard: models::ShardId, all_shards: &[models::ShardId]) -> u64 {
    match scope {
        StepScope::AllShards => all_shards.len().max(1) as u64,
        StepScope::SingleShard { .. } => 1,
    }
}

/// Groups expanded steps into topological-level stages: stage N+1 contains
/// only steps whose dependencies lie entirely in stages 0..=N.
fn layer_into_stages(expanded: &[ExpandedStep]) -> Result<Vec<Stage>, PlanError> {
    let mut remaining: Vec<&Step> = expanded.iter().map(|e| &e.step).collect();
    let mut placed: BTreeSet<StepId> = BTreeSet::new();
    let mut stages = Vec::new();

    while !remaining.is_empty() {
        let (ready, not_ready): (Vec<&Step>, Vec<&Step>) = remaining
            .into_iter()
            .partition(|s| s.dependencies.iter().all(|d| placed.contains(d)));

        if ready.is_empty() {
            let step_id = not_ready
                .first()
                .map(|s| s.id.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(PlanError::Cycle { step_id });
        }

        // Bias scheduling toward the longest critical path: within a stage,
        // sort by estimated cost descending (§4.5's advisory hint consumed
        // later by the Orchestrator's dispatch queue).
        let mut ready = ready;
        ready.sort_by(|a, b| b.estimated_items.cmp(&a.estimated_items));

        for step in &ready {
            placed.insert(step.id.clone());
        }
        stages.push(Stage {
            steps: ready.into_iter().cloned().collect(),
        });

        remaining = not_ready;
    }

    Ok(stages)
}

fn digest_of(request_id: &str, stages: &[Stage]) -> String {
    let mut hasher_input = String::from(request_id);
    for stage in stages {
        for step in &stage.steps {
            hasher_input.push('|');
            hasher_input.push_str(&step.id.to_string());
            hasher_input.push(':');
            hasher_input.push_str(&step.payload_ref);
        }
        hasher_input.push(';');
    }
    format!("{:016x}", fnv1a(hasher_input.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{ConcurrencyHint, Id, RollbackPolicy};

    fn request(steps: Vec<RequestStep>) -> MigrationRequest {
        MigrationRequest {
            request_id: Id::from_hex("0000000000000001").unwrap(),
            name: "test".into(),
            store_class: StoreClass::Document,
            steps,
            depends_on: vec![],
            concurrency_hint: ConcurrencyHint::default(),
            idempotency_key: "key-1".into(),
            rollback_policy: RollbackPolicy::Compensate,
            cross_shard_probes: vec![],
        }
    }

    async fn topology_with_shards(n: u32) -> Topology {
        let source = topology::StaticSource::new(vec![(StoreClass::Document, n)]);
        Topology::new(Box::new(source)).await.unwrap()
    }

    #[tokio::test]
    async fn expands_all_shards_step_and_orders_schema_before_data() {
        let steps = vec![
            RequestStep {
                step_id: "add_version_column".into(),
                kind: StepKind::Schema,
                scope: StepScope::AllShards,
                payload_ref: "schema/add_version".into(),
                depends_on: vec![],
                estimated_items: None,
            },
            RequestStep {
                step_id: "backfill_version".into(),
                kind: StepKind::Data,
                scope: StepScope::AllShards,
                payload_ref: "transform/set_version".into(),
                depends_on: vec!["add_version_column".into()],
                estimated_items: Some(300),
            },
        ];

        let topology = topology_with_shards(3).await;
        let plan = plan(&request(steps), &topology).await.unwrap();

        assert_eq!(plan.step_count(), 6); // 2 steps x 3 shards
        assert_eq!(plan.stages.len(), 2);
        assert!(plan.stages[0].steps.iter().all(|s| s.kind == StepKind::Schema));
        assert!(plan.stages[1].steps.iter().all(|s| s.kind == StepKind::Data));
    }

    #[tokio::test]
    async fn self_dependency_is_rejected_as_a_cycle() {
        let steps = vec![RequestStep {
            step_id: "a".into(),
            kind: StepKind::Schema,
            scope: StepScope::AllShards,
            payload_ref: "x".into(),
            depends_on: vec!["a".into()],
            estimated_items: None,
        }];

        let topology = topology_with_shards(1).await;
        let err = plan(&request(steps), &topology).await.unwrap_err();
        assert!(matches!(err, PlanError::Cycle { .. }));
    }

    #[tokio::test]
    async fn plan_digest_is_stable_for_identical_input() {
        let steps = vec![RequestStep {
            step_id: "a".into(),
            kind: StepKind::Schema,
            scope: StepScope::AllShards,
            payload_ref: "x".into(),
            depends_on: vec![],
            estimated_items: None,
        }];

        let topology = topology_with_shards(2).await;
        let first = plan(&request(steps.clone()), &topology).await.unwrap();
        let second = plan(&request(steps), &topology).await.unwrap();
        assert_eq!(first.digest, second.digest);
    }
}
