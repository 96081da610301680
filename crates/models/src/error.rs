/// ErrorClass is the §7 error taxonomy. It determines whether the engine
/// retries locally, promotes to step failure, or fails the Migration
/// outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection loss, timeout, back-end "retry later." Retried with
    /// exponential backoff up to a step-level attempt limit.
    Transient,
    /// Lock busy or optimistic CAS failure. Retried with shorter backoff;
    /// exceeding the contention threshold fails the step.
    Contention,
    /// Schema conflict, transformer rejection, validation mismatch. Never
    /// retried.
    Logical,
    /// Plan cycle, missing compensation, topology mismatch. Fails the
    /// Migration before or at the transition that detects it.
    Structural,
    /// Status Store unavailable. Scheduling suspends; in-flight executors
    /// continue to their next commit boundary then park.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Contention)
    }
}

/// EngineError is the classified error type threaded through the
/// coordination engine. Every terminal failure's `failed` event and the
/// owning Migration's `last_error` are rendered from one of these.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("topology version {resumed:?} is stale; current version is {current:?}, a re-plan is required")]
    TopologyStale {
        resumed: crate::TopologyVersion,
        current: crate::TopologyVersion,
    },

    #[error("plan contains a dependency cycle through step {step_id:?}")]
    PlanCycle { step_id: String },

    #[error("resource {resource} is held by another migration")]
    LockBusy { resource: String },

    #[error("lock on {resource} could not be acquired within the contention window")]
    LockUnavailable { resource: String },

    #[error("step {step_id} on shard {shard} has no registered compensation and cannot be rolled back")]
    Unrecoverable { step_id: String, shard: String },

    #[error("{class:?} error in step {step_id} on shard {shard}: {message}")]
    Step {
        class: ErrorClass,
        step_id: String,
        shard: String,
        message: String,
    },

    #[error("status store is unavailable: {0}")]
    StatusStoreUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::TopologyStale { .. } | EngineError::PlanCycle { .. } => {
                ErrorClass::Structural
            }
            EngineError::LockBusy { .. } | EngineError::LockUnavailable { .. } => {
                ErrorClass::Contention
            }
            EngineError::Unrecoverable { .. } => ErrorClass::Structural,
            EngineError::Step { class, .. } => *class,
            EngineError::StatusStoreUnavailable(_) => ErrorClass::Fatal,
            EngineError::Other(_) => ErrorClass::Logical,
        }
    }
}
