mod error;
mod event;
mod filter;
mod id;
mod lock;
mod migration;
mod plan;
mod progress;
mod request;
mod shard;

pub use error::{EngineError, ErrorClass};
pub use event::{Event, EventKind};
pub use filter::MigrationFilter;
pub use id::{Id, IdGenerator};
pub use lock::{Lock, Resource};
pub use migration::{Migration, MigrationState};
pub use plan::{Plan, Stage, Step, StepId};
pub use progress::{ShardProgress, ShardProgressStatus};
pub use request::{
    ConcurrencyHint, MigrationRequest, RequestStep, RollbackPolicy, RoutedShard, StepKind,
    StepScope,
};
pub use shard::{ShardId, StoreClass, TopologyVersion};
