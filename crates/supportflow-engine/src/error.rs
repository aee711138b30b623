//! Engine error types.
//!
//! Two layers of failure exist:
//!
//! - [`EngineError`] covers the engine's own operations (loading rules,
//!   arming schedules, force-firing). These are returned to callers.
//! - [`ActionError`] covers a single action. It never escapes the action
//!   executor: every `ActionError` becomes a failed
//!   [`ExecutionResult`](crate::executor::ExecutionResult).

use supportflow_store::StoreError;

/// Unified error type for engine-level operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Persistence ---------------------------------------------------------
    /// The rule, schedule or audit store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // -- Rules ---------------------------------------------------------------
    /// The referenced rule does not exist.
    #[error("rule not found: {rule_id}")]
    RuleNotFound { rule_id: String },

    /// The rule exists but is not `active`.
    #[error("rule {rule_id} is {status}, only active rules can fire")]
    RuleNotActive { rule_id: String, status: String },

    /// The rule has reached its `max_executions` cap.
    #[error("rule {rule_id} has reached its execution limit")]
    ExecutionLimitReached { rule_id: String },

    /// A trigger configuration or conditions block could not be interpreted.
    #[error("invalid {trigger} configuration: {reason}")]
    InvalidTriggerConfig { trigger: String, reason: String },

    // -- Scheduling ----------------------------------------------------------
    /// A cron expression is invalid.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// A timezone name is not a known IANA zone.
    #[error("unknown timezone `{0}`")]
    InvalidTimezone(String),

    /// The scheduler was asked to start twice.
    #[error("scheduler is already running")]
    SchedulerRunning,
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of a single action. Converted to a failed result, never thrown.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    /// The action's configuration is missing a field or has a bad value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A user, conversation or operator could not be resolved.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The target user's platform has no delivery channel.
    #[error("unsupported channel: {platform}")]
    UnsupportedChannel { platform: String },

    /// The messaging collaborator rejected or failed the delivery.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The AI collaborator failed to produce an answer.
    #[error("ai generation failed: {0}")]
    Generation(String),

    /// The handler did not finish within its time budget.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The handler task panicked or was cancelled.
    #[error("handler task failed: {0}")]
    TaskFailed(String),

    /// No handler is registered for the action type.
    #[error("no handler registered for action type `{action_type}`")]
    NoHandler { action_type: String },

    /// A read-model write or read failed.
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Store(other.to_string()),
        }
    }
}
