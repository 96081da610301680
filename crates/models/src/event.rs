use crate::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EventKind enumerates the append-only audit/progress-replay events a
/// Migration emits across its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Started,
    StepStarted,
    Progress,
    StepCompleted,
    StepFailed,
    ValidationFailed,
    Failed,
    RolledBack,
    Completed,
    Cancelled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Started => "started",
            EventKind::StepStarted => "step_started",
            EventKind::Progress => "progress",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::ValidationFailed => "validation_failed",
            EventKind::Failed => "failed",
            EventKind::RolledBack => "rolled_back",
            EventKind::Completed => "completed",
            EventKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Postgres> for EventKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Encode<'_, sqlx::Postgres> for EventKind {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        sqlx::Encode::<sqlx::Postgres>::encode(self.to_string(), buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for EventKind {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        use EventKind::*;
        Ok(match s.as_str() {
            "created" => Created,
            "started" => Started,
            "step_started" => StepStarted,
            "progress" => Progress,
            "step_completed" => StepCompleted,
            "step_failed" => StepFailed,
            "validation_failed" => ValidationFailed,
            "failed" => Failed,
            "rolled_back" => RolledBack,
            "completed" => Completed,
            "cancelled" => Cancelled,
            other => return Err(format!("unrecognized event kind {other:?}").into()),
        })
    }
}

/// Event is an append-only audit record. Events for a given migration are
/// published in state-transition order; consumers dedupe by `id` since
/// delivery through the Event Bus is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub migration_id: Id,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}
