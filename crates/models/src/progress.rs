use crate::{Id, ShardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardProgressStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for ShardProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShardProgressStatus::Pending => "pending",
            ShardProgressStatus::Running => "running",
            ShardProgressStatus::Completed => "completed",
            ShardProgressStatus::Failed => "failed",
            ShardProgressStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Postgres> for ShardProgressStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Encode<'_, sqlx::Postgres> for ShardProgressStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        sqlx::Encode::<sqlx::Postgres>::encode(self.to_string(), buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ShardProgressStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        use ShardProgressStatus::*;
        Ok(match s.as_str() {
            "pending" => Pending,
            "running" => Running,
            "completed" => Completed,
            "failed" => Failed,
            "skipped" => Skipped,
            other => return Err(format!("unrecognized shard progress status {other:?}").into()),
        })
    }
}

/// ShardProgress is the durable execution record of one (migration, step,
/// shard) triple. `last_checkpoint` is an opaque, shard-local cursor that
/// the Batch Pump resumes from after a crash; it is only ever advanced
/// after the batch it names has been durably applied at the target (see
/// the Store Driver Contract, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardProgress {
    pub migration_id: Id,
    pub step_id: String,
    pub shard: ShardId,
    pub status: ShardProgressStatus,
    pub items_processed: u64,
    pub total_items: Option<u64>,
    pub last_checkpoint: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub version: i64,
}

impl ShardProgress {
    pub fn new(migration_id: Id, step_id: impl Into<String>, shard: ShardId) -> Self {
        Self {
            migration_id,
            step_id: step_id.into(),
            shard,
            status: ShardProgressStatus::Pending,
            items_processed: 0,
            total_items: None,
            last_checkpoint: None,
            started_at: None,
            ended_at: None,
            error: None,
            version: 0,
        }
    }

    pub fn is_complete_or_skipped(&self) -> bool {
        matches!(
            self.status,
            ShardProgressStatus::Completed | ShardProgressStatus::Skipped
        )
    }
}
