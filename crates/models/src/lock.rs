use crate::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource identifies what a `Lock` protects: an individual shard (scoped
/// to a store class), a named collection, or the process-wide `global`
/// resource used to serialize structural operations like topology refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Shard { store_class: String, shard: u32 },
    Collection(String),
    Global,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Shard { store_class, shard } => write!(f, "shard:{store_class}:{shard}"),
            Resource::Collection(name) => write!(f, "collection:{name}"),
            Resource::Global => write!(f, "global"),
        }
    }
}

impl std::str::FromStr for Resource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Resource::Global);
        }
        if let Some(rest) = s.strip_prefix("collection:") {
            return Ok(Resource::Collection(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("shard:") {
            let (store_class, shard) = rest
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("malformed shard resource {s:?}"))?;
            let shard: u32 = shard.parse()?;
            return Ok(Resource::Shard {
                store_class: store_class.to_string(),
                shard,
            });
        }
        anyhow::bail!("unrecognized resource {s:?}")
    }
}

/// Lock is a leased, fenced advisory hold over a `Resource`. The holder
/// renews at one-third of `expires_at - acquired_at`; any process may reap
/// a lock whose holding Migration has reached a terminal state, or whose
/// lease has expired past TTL plus grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub resource: Resource,
    pub holder: Id,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: i64,
}
