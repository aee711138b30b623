//! `assign_to_operator`: route a conversation to a human operator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use supportflow_store::{ActionSpec, DirectoryStore, Operator};
use tracing::info;

use super::{parse_config, resolve_id};
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::registry::{ActionHandler, BuiltinAction};

/// Engine-state key holding the last operator picked by round robin.
const ROUND_ROBIN_CURSOR: &str = "assignment.round_robin_cursor";

/// How an operator is chosen when none is named explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Available operator with the fewest open conversations.
    #[default]
    LeastBusy,
    /// Cycle through active operators in id order.
    RoundRobin,
    /// Least busy available operator holding `role`.
    ByRole,
    /// Available operator with the fewest assignments in the recent window.
    ByAvailability,
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastBusy => "least_busy",
            Self::RoundRobin => "round_robin",
            Self::ByRole => "by_role",
            Self::ByAvailability => "by_availability",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssignConfig {
    #[serde(default)]
    operator_id: Option<String>,
    #[serde(default)]
    strategy: Option<AssignmentStrategy>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

pub struct AssignOperatorHandler {
    directory: DirectoryStore,
    window_minutes: i64,
}

impl AssignOperatorHandler {
    pub fn new(directory: DirectoryStore, window_minutes: i64) -> Self {
        Self {
            directory,
            window_minutes,
        }
    }

    async fn pick(
        &self,
        strategy: AssignmentStrategy,
        role: Option<&str>,
        now: i64,
    ) -> Result<Option<Operator>, ActionError> {
        let picked = match strategy {
            AssignmentStrategy::LeastBusy => self
                .directory
                .operator_loads()
                .await?
                .into_iter()
                .filter(|load| load.operator.is_available)
                .min_by_key(|load| load.open_conversations)
                .map(|load| load.operator),
            AssignmentStrategy::ByRole => {
                let role = role.filter(|r| !r.is_empty()).ok_or_else(|| {
                    ActionError::InvalidConfig("strategy `by_role` requires `role`".into())
                })?;
                self.directory
                    .operator_loads()
                    .await?
                    .into_iter()
                    .filter(|load| load.operator.is_available)
                    .filter(|load| {
                        load.operator
                            .role
                            .as_deref()
                            .is_some_and(|r| r.eq_ignore_ascii_case(role))
                    })
                    .min_by_key(|load| load.open_conversations)
                    .map(|load| load.operator)
            }
            AssignmentStrategy::ByAvailability => self
                .directory
                .recent_assignment_counts(now - self.window_minutes * 60)
                .await?
                .into_iter()
                .filter(|(operator, _)| operator.is_available)
                .min_by_key(|(_, count)| *count)
                .map(|(operator, _)| operator),
            AssignmentStrategy::RoundRobin => {
                self.directory
                    .next_round_robin_operator(ROUND_ROBIN_CURSOR)
                    .await?
            }
        };
        Ok(picked)
    }
}

#[async_trait]
impl ActionHandler for AssignOperatorHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::AssignToOperator.as_str()
    }

    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext) -> Result<Value, ActionError> {
        let config: AssignConfig = parse_config(action)?;
        let conversation_id = resolve_id(
            config.conversation_id.as_deref(),
            ctx.conversation_id.as_deref(),
            "conversation",
        )?;

        let (operator, strategy) = match config.operator_id.as_deref() {
            Some(operator_id) => {
                let operator = self
                    .directory
                    .get_operator(operator_id)
                    .await?
                    .filter(|op| op.is_active)
                    .ok_or_else(|| ActionError::NotFound {
                        entity: "operator",
                        id: operator_id.to_string(),
                    })?;
                (operator, "explicit")
            }
            None => {
                let strategy = config.strategy.unwrap_or_default();
                let operator = self
                    .pick(strategy, config.role.as_deref(), ctx.timestamp)
                    .await?
                    .ok_or_else(|| ActionError::NotFound {
                        entity: "operator",
                        id: format!("any matching strategy {}", strategy.as_str()),
                    })?;
                (operator, strategy.as_str())
            }
        };

        self.directory
            .assign_operator(&conversation_id, &operator.id, ctx.timestamp)
            .await?;
        info!(%conversation_id, operator_id = %operator.id, strategy, "conversation assigned");

        Ok(json!({
            "conversation_id": conversation_id,
            "operator_id": operator.id,
            "operator_name": operator.name,
            "strategy": strategy,
        }))
    }
}
