//! Action executor.
//!
//! Runs a rule's action list strictly in order. Each action is resolved in
//! the [`HandlerRegistry`], optionally preceded by its own delay, and run in
//! its own task under a time budget so that a panicking or hung handler
//! becomes a failed [`ExecutionResult`] instead of taking the engine down.
//! A failed action never stops the actions after it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use supportflow_store::{ActionSpec, ExecutionStatus};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::registry::HandlerRegistry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The outcome of one attempted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action_type: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn success(action_type: impl Into<String>, result: Value, elapsed: Duration) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            result: Some(result),
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failure(action_type: impl Into<String>, error: &ActionError, elapsed: Duration) -> Self {
        Self {
            action_type: action_type.into(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Fold per-action results into the status recorded for the firing.
///
/// All succeeded is `Success`, none succeeded is `Failed` and anything in
/// between is `Partial`. An empty list counts as success.
pub fn aggregate_status(results: &[ExecutionResult]) -> ExecutionStatus {
    let succeeded = results.iter().filter(|r| r.success).count();
    if succeeded == results.len() {
        ExecutionStatus::Success
    } else if succeeded == 0 {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Partial
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActionExecutor {
    registry: HandlerRegistry,
    config: EngineConfig,
}

impl ActionExecutor {
    pub fn new(registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Run `actions` in order, one result per action.
    pub async fn execute(&self, actions: &[ActionSpec], ctx: &TriggerContext) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            if let Some(delay) = action.delay.filter(|d| *d > 0) {
                let delay = Duration::from_secs(delay).min(self.config.max_action_delay());
                debug!(index, action_type = %action.action_type, ?delay, "delaying action");
                tokio::time::sleep(delay).await;
            }

            let result = self.execute_one(action, ctx).await;
            if let Some(error) = &result.error {
                warn!(index, action_type = %action.action_type, %error, "action failed");
            } else {
                debug!(index, action_type = %action.action_type, elapsed_ms = result.elapsed_ms, "action succeeded");
            }
            results.push(result);
        }
        results
    }

    async fn execute_one(&self, action: &ActionSpec, ctx: &TriggerContext) -> ExecutionResult {
        let started = Instant::now();
        let Some(handler) = self.registry.resolve(&action.action_type) else {
            let err = ActionError::NoHandler {
                action_type: action.action_type.clone(),
            };
            return ExecutionResult::failure(&action.action_type, &err, started.elapsed());
        };

        let budget = handler
            .timeout(action)
            .unwrap_or_else(|| self.config.handler_timeout());

        let task = {
            let handler = Arc::clone(&handler);
            let action = action.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.execute(&action, &ctx).await })
        };
        let abort = task.abort_handle();

        let outcome = match tokio::time::timeout(budget, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(ActionError::TaskFailed(join_error.to_string())),
            Err(_elapsed) => {
                abort.abort();
                Err(ActionError::Timeout {
                    seconds: budget.as_secs(),
                })
            }
        };

        match outcome {
            Ok(value) => ExecutionResult::success(&action.action_type, value, started.elapsed()),
            Err(err) => ExecutionResult::failure(&action.action_type, &err, started.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::registry::ActionHandler;

    /// Records the order of invocations, fails on demand.
    struct Scripted {
        tag: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ActionHandler for Scripted {
        fn action_type(&self) -> &str {
            self.tag
        }

        async fn execute(&self, action: &ActionSpec, _ctx: &TriggerContext) -> Result<Value, ActionError> {
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, action.config));
            if self.fail {
                Err(ActionError::Delivery("scripted failure".into()))
            } else {
                Ok(json!({"ok": self.tag}))
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl ActionHandler for Panics {
        fn action_type(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _: &ActionSpec, _: &TriggerContext) -> Result<Value, ActionError> {
            panic!("boom");
        }
    }

    struct Hangs;

    #[async_trait]
    impl ActionHandler for Hangs {
        fn action_type(&self) -> &str {
            "hangs"
        }

        async fn execute(&self, _: &ActionSpec, _: &TriggerContext) -> Result<Value, ActionError> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }

        fn timeout(&self, _: &ActionSpec) -> Option<Duration> {
            Some(Duration::from_secs(2))
        }
    }

    fn executor_with(handlers: Vec<Arc<dyn ActionHandler>>) -> ActionExecutor {
        let registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        ActionExecutor::new(registry, EngineConfig::default())
    }

    #[tokio::test]
    async fn failure_does_not_stop_later_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = executor_with(vec![
            Arc::new(Scripted { tag: "ok", fail: false, log: log.clone() }),
            Arc::new(Scripted { tag: "bad", fail: true, log: log.clone() }),
        ]);

        let actions = vec![
            ActionSpec::new("ok", json!(1)),
            ActionSpec::new("bad", json!(2)),
            ActionSpec::new("ok", json!(3)),
        ];
        let results = executor.execute(&actions, &TriggerContext::manual(json!({}))).await;

        assert_eq!(
            results.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(results[1].error.as_deref(), Some("delivery failed: scripted failure"));
        assert_eq!(*log.lock().unwrap(), vec!["ok:1", "bad:2", "ok:3"]);
        assert_eq!(aggregate_status(&results), ExecutionStatus::Partial);
    }

    #[tokio::test]
    async fn unknown_action_type_is_a_failed_result() {
        let executor = executor_with(vec![]);
        let results = executor
            .execute(&[ActionSpec::new("teleport", json!({}))], &TriggerContext::manual(json!({})))
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(
            results[0].error.as_deref(),
            Some("no handler registered for action type `teleport`")
        );
        assert_eq!(aggregate_status(&results), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = executor_with(vec![
            Arc::new(Panics),
            Arc::new(Scripted { tag: "ok", fail: false, log: log.clone() }),
        ]);
        let actions = vec![ActionSpec::new("panics", json!({})), ActionSpec::new("ok", json!(0))];
        let results = executor.execute(&actions, &TriggerContext::manual(json!({}))).await;

        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("panicked"));
        assert!(results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out() {
        let executor = executor_with(vec![Arc::new(Hangs)]);
        let results = executor
            .execute(&[ActionSpec::new("hangs", json!({}))], &TriggerContext::manual(json!({})))
            .await;
        assert_eq!(results[0].error.as_deref(), Some("timed out after 2s"));
    }

    #[tokio::test(start_paused = true)]
    async fn per_action_delay_is_capped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Scripted { tag: "ok", fail: false, log }));
        let config = EngineConfig {
            max_action_delay_secs: 30,
            ..EngineConfig::default()
        };
        let executor = ActionExecutor::new(registry, config);

        let started = Instant::now();
        let results = executor
            .execute(
                &[ActionSpec::new("ok", json!({})).with_delay(600)],
                &TriggerContext::manual(json!({})),
            )
            .await;
        assert!(results[0].success);
        assert_eq!(started.elapsed().as_secs(), 30);
    }

    #[test]
    fn aggregate_status_rules() {
        let ok = ExecutionResult::success("a", json!(null), Duration::ZERO);
        let bad = ExecutionResult::failure("a", &ActionError::InvalidConfig("x".into()), Duration::ZERO);
        assert_eq!(aggregate_status(&[ok.clone(), ok.clone()]), ExecutionStatus::Success);
        assert_eq!(aggregate_status(&[bad.clone()]), ExecutionStatus::Failed);
        assert_eq!(aggregate_status(&[ok, bad]), ExecutionStatus::Partial);
        assert_eq!(aggregate_status(&[]), ExecutionStatus::Success);
    }
}
