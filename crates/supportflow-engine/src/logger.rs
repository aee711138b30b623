//! Execution logger: one audit record per rule firing.

use std::time::Duration;

use supportflow_store::{ExecutionLogStore, ExecutionRecord, NewExecutionRecord, Rule};
use tracing::{error, warn};

use crate::context::TriggerContext;
use crate::executor::{ExecutionResult, aggregate_status};

#[derive(Clone)]
pub struct ExecutionLogger {
    log: ExecutionLogStore,
}

impl ExecutionLogger {
    pub fn new(log: ExecutionLogStore) -> Self {
        Self { log }
    }

    /// Build the audit record for a firing of `rule`.
    pub fn build_record(
        rule: &Rule,
        ctx: &TriggerContext,
        results: &[ExecutionResult],
        elapsed: Duration,
    ) -> NewExecutionRecord {
        NewExecutionRecord {
            rule_id: rule.id.clone(),
            trigger_type: rule.trigger_type.as_str().to_string(),
            trigger_data: serde_json::to_value(ctx).unwrap_or_default(),
            actions: rule.actions.clone(),
            results: serde_json::to_value(results).unwrap_or_default(),
            status: aggregate_status(results),
            error_message: results.iter().find_map(|r| r.error.clone()),
            execution_time_ms: elapsed.as_millis() as i64,
            user_id: ctx.user_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            message_id: ctx.message_id.clone(),
        }
    }

    /// Persist the record, retrying once. If both attempts fail the record
    /// goes to the error log and `None` is returned; the firing itself is
    /// never undone.
    pub async fn record(
        &self,
        rule: &Rule,
        ctx: &TriggerContext,
        results: &[ExecutionResult],
        elapsed: Duration,
    ) -> Option<ExecutionRecord> {
        let record = Self::build_record(rule, ctx, results, elapsed);

        match self.log.append(record.clone()).await {
            Ok(stored) => return Some(stored),
            Err(e) => warn!(rule_id = %rule.id, error = %e, "audit append failed, retrying"),
        }

        match self.log.append(record.clone()).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                let dump = serde_json::to_string(&record).unwrap_or_default();
                error!(rule_id = %rule.id, error = %e, record = %dump, "audit record lost");
                None
            }
        }
    }
}
