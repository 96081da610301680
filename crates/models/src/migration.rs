use crate::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MigrationState enumerates the lifecycle of a `Migration`. See §3 for the
/// full transition diagram; transitions are driven exclusively by the
/// Orchestrator through the Status Store's CAS primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Created,
    Planning,
    Pending,
    Running,
    Validating,
    Completed,
    Failing,
    RollingBack,
    RolledBack,
    Cancelling,
    Cancelled,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed
                | MigrationState::RolledBack
                | MigrationState::Cancelled
                | MigrationState::Failed
        )
    }

    /// Whether `next` is a legal transition from `self`, per the state
    /// machine in §4.6. Used by the Status Store to reject illegal CAS
    /// writes and by tests to assert that an event log describes a valid
    /// walk.
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Created, Planning)
                | (Planning, Pending)
                | (Planning, Failed)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Validating)
                | (Running, Failing)
                | (Validating, Completed)
                | (Validating, Failing)
                | (Failing, RollingBack)
                | (Failing, Failed)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
                | (Created, Cancelling)
                | (Planning, Cancelling)
                | (Pending, Cancelling)
                | (Running, Cancelling)
                | (Validating, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Created => "created",
            MigrationState::Planning => "planning",
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Validating => "validating",
            MigrationState::Completed => "completed",
            MigrationState::Failing => "failing",
            MigrationState::RollingBack => "rolling_back",
            MigrationState::RolledBack => "rolled_back",
            MigrationState::Cancelling => "cancelling",
            MigrationState::Cancelled => "cancelled",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Type<sqlx::Postgres> for MigrationState {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

#[cfg(feature = "sqlx-support")]
impl sqlx::Encode<'_, sqlx::Postgres> for MigrationState {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        sqlx::Encode::<sqlx::Postgres>::encode(self.to_string(), buf)
    }
}

#[cfg(feature = "sqlx-support")]
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for MigrationState {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        use MigrationState::*;
        Ok(match s.as_str() {
            "created" => Created,
            "planning" => Planning,
            "pending" => Pending,
            "running" => Running,
            "validating" => Validating,
            "completed" => Completed,
            "failing" => Failing,
            "rolling_back" => RollingBack,
            "rolled_back" => RolledBack,
            "cancelling" => Cancelling,
            "cancelled" => Cancelled,
            "failed" => Failed,
            other => return Err(format!("unrecognized migration state {other:?}").into()),
        })
    }
}

/// Migration is the live execution record for an admitted `MigrationRequest`.
/// It is created once and mutated only through the Status Store's
/// append-or-CAS operations; terminal records remain for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: Id,
    pub request_id: Id,
    pub plan_digest: Option<String>,
    pub state: MigrationState,
    pub current_stage: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub final_outcome: Option<String>,
    pub last_error: Option<String>,
    /// CAS version. Every write bumps this by one; writers must present the
    /// version they read, and stale writes are rejected.
    pub version: i64,
    /// Owner token of the coordinator process currently driving this
    /// Migration. Lets a second coordinator take over a Migration whose
    /// prior owner disappeared, by CAS-claiming it.
    pub owner_token: i64,
    /// Unrecoverable steps recorded when rollback could not be completed
    /// for every successfully-applied step (see §4.6).
    pub unrecoverable_steps: Vec<String>,
}
