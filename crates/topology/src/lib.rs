//! Topology enumerates shards per `StoreClass` and resolves a routing key to
//! a concrete `ShardId`. Routing is deterministic given a snapshot version: a
//! `Plan` pins the `TopologyVersion` it was built against, so a crash-resumed
//! Migration can detect that the shard set underneath it has moved on (see
//! §4.1 and the `TopologyStale` error class).

use models::{ShardId, StoreClass, TopologyVersion};
use std::collections::BTreeMap;
use std::sync::RwLock;

mod source;

pub use source::{DiscoverySource, StaticSource, TopologySource};

/// A single immutable snapshot of the shard set for every `StoreClass`,
/// tagged with the `TopologyVersion` it was produced at.
#[derive(Debug, Clone)]
struct Snapshot {
    version: TopologyVersion,
    shards: BTreeMap<StoreClass, Vec<ShardId>>,
}

/// Topology is the live, refreshable view over shard membership. It keeps a
/// history of retired snapshots only long enough to classify a resumed
/// Migration's pinned version as current or stale; it never discards the
/// *current* snapshot.
pub struct Topology {
    source: Box<dyn TopologySource>,
    current: RwLock<Snapshot>,
}

impl Topology {
    pub async fn new(source: Box<dyn TopologySource>) -> anyhow::Result<Self> {
        let shards = source.discover().await?;
        Ok(Self {
            source,
            current: RwLock::new(Snapshot {
                version: TopologyVersion(0),
                shards,
            }),
        })
    }

    /// Returns the shard set for `store_class` as of the current snapshot,
    /// along with the version it was read at.
    pub fn shards_of(&self, store_class: StoreClass) -> (TopologyVersion, Vec<ShardId>) {
        let snapshot = self.current.read().unwrap();
        (
            snapshot.version,
            snapshot
                .shards
                .get(&store_class)
                .cloned()
                .unwrap_or_default(),
        )
    }

    pub fn current_version(&self) -> TopologyVersion {
        self.current.read().unwrap().version
    }

    /// Deterministically routes `key` to a `ShardId` within `store_class`,
    /// for the current snapshot. Routing is a stable hash of the key modulo
    /// the shard count, so the same key always lands on the same shard for
    /// a fixed shard count -- it does not attempt consistent-hash stability
    /// across a shard count change; a changed shard count bumps the
    /// `TopologyVersion` and callers holding an older Plan must re-plan.
    pub fn route(&self, key: &str, store_class: StoreClass) -> anyhow::Result<ShardId> {
        let (version, shards) = self.shards_of(store_class);
        if shards.is_empty() {
            anyhow::bail!("no shards are registered for store class {store_class} at topology version {version:?}");
        }
        let digest = fnv1a(key.as_bytes());
        let index = (digest % shards.len() as u64) as usize;
        Ok(shards[index])
    }

    /// Re-queries the `TopologySource` and, if the shard membership for any
    /// store class has changed, installs a new snapshot under a bumped
    /// `TopologyVersion`. Returns the version current after the refresh.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> anyhow::Result<TopologyVersion> {
        let discovered = self.source.discover().await?;

        let mut snapshot = self.current.write().unwrap();
        if snapshot.shards == discovered {
            return Ok(snapshot.version);
        }

        let next = TopologyVersion(snapshot.version.0 + 1);
        tracing::info!(from = ?snapshot.version, to = ?next, "topology membership changed");
        *snapshot = Snapshot {
            version: next,
            shards: discovered,
        };
        Ok(next)
    }

    /// Verifies that `pinned` still matches the current snapshot's version.
    /// Steps resuming against a stale version must fail with
    /// `EngineError::TopologyStale`; resolution is a manual re-plan (§4.1).
    pub fn check_current(&self, pinned: TopologyVersion) -> Result<(), models::EngineError> {
        let current = self.current_version();
        if pinned == current {
            Ok(())
        } else {
            Err(models::EngineError::TopologyStale {
                resumed: pinned,
                current,
            })
        }
    }
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

    #[tokio::test]
    async fn routing_is_deterministic_and_stable_for_a_fixed_shard_count() {
        let source = StaticSource::new(vec![(StoreClass::Document, 4), (StoreClass::Relational, 3)]);
        let topology = Topology::new(Box::new(source)).await.unwrap();

        let first = topology.route("user-42", StoreClass::Document).unwrap();
        let second = topology.route("user-42", StoreClass::Document).unwrap();
        assert_eq!(first, second);

        let (version, shards) = topology.shards_of(StoreClass::Relational);
        assert_eq!(version, TopologyVersion(0));
        assert_eq!(shards.len(), 3);
    }

    #[tokio::test]
    async fn refresh_bumps_version_only_on_membership_change() {
        let source = StaticSource::new(vec![(StoreClass::Document, 2)]);
        let topology = Topology::new(Box::new(source)).await.unwrap();
        assert_eq!(topology.refresh().await.unwrap(), TopologyVersion(0));

        let growing = source::test_support::GrowingSource::new(2, 3);
        let topology = Topology::new(Box::new(growing)).await.unwrap();
        assert_eq!(topology.current_version(), TopologyVersion(0));
        let bumped = topology.refresh().await.unwrap();
        assert_eq!(bumped, TopologyVersion(1));
    }

    #[tokio::test]
    async fn stale_pinned_version_is_rejected() {
        let growing = source::test_support::GrowingSource::new(1, 2);
        let topology = Topology::new(Box::new(growing)).await.unwrap();
        let pinned = topology.current_version();

        topology.refresh().await.unwrap();

        let err = topology.check_current(pinned).unwrap_err();
        assert_eq!(err.class(), models::ErrorClass::Structural);
    }
}
