use async_trait::async_trait;
use models::{ShardId, StoreClass};
use std::collections::BTreeMap;

/// TopologySource is queried by `Topology::refresh` to learn the current
/// shard membership of every store class. The engine's configuration
/// selects between `static` (a fixed count per store class, read from
/// configuration) and `discovery` (queried from an external registrar);
/// both are named in the `topology_source` configuration option (§6).
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    async fn discover(&self) -> anyhow::Result<BTreeMap<StoreClass, Vec<ShardId>>>;
}

/// StaticSource reports a fixed shard count per store class, configured
/// once at startup. Used when the deployment's shard topology is pinned by
/// the operator rather than discovered at runtime.
pub struct StaticSource {
    counts: BTreeMap<StoreClass, u32>,
}

impl StaticSource {
    pub fn new(counts: impl IntoIterator<Item = (StoreClass, u32)>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TopologySource for StaticSource {
    async fn discover(&self) -> anyhow::Result<BTreeMap<StoreClass, Vec<ShardId>>> {
        Ok(self
            .counts
            .iter()
            .map(|(class, count)| (*class, (0..*count).map(ShardId).collect()))
            .collect())
    }
}

/// DiscoverySource queries an external registrar (e.g. a control-plane
/// catalog) for the current shard set of each store class. The concrete
/// wire protocol to the registrar is out of scope (§1); this is the
/// contract the Orchestrator depends on.
pub struct DiscoverySource {
    registrar: Box<dyn Registrar>,
}

#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    async fn list_shards(&self, store_class: StoreClass) -> anyhow::Result<Vec<ShardId>>;
}

impl DiscoverySource {
    pub fn new(registrar: Box<dyn Registrar>) -> Self {
        Self { registrar }
    }
}

#[async_trait]
impl TopologySource for DiscoverySource {
    async fn discover(&self) -> anyhow::Result<BTreeMap<StoreClass, Vec<ShardId>>> {
        let mut out = BTreeMap::new();
        for class in [StoreClass::Document, StoreClass::Relational] {
            out.insert(class, self.registrar.list_shards(class).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// GrowingSource reports `before` shards on its first call and `after`
    /// shards on every call thereafter, for exercising `Topology::refresh`.
    pub struct GrowingSource {
        before: u32,
        after: u32,
        called: AtomicBool,
    }

    impl GrowingSource {
        pub fn new(before: u32, after: u32) -> Self {
            Self {
                before,
                after,
                called: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TopologySource for GrowingSource {
        async fn discover(&self) -> anyhow::Result<BTreeMap<StoreClass, Vec<ShardId>>> {
            let count = if self.called.swap(true, Ordering::SeqCst) {
                self.after
            } else {
                self.before
            };
            let mut out = BTreeMap::new();
            out.insert(StoreClass::Document, (0..count).map(ShardId).collect());
            Ok(out)
        }
    }
}
