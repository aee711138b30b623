//! The dispatcher: trigger context in, ordered rule firings out.
//!
//! For every incoming [`TriggerContext`] the engine loads the active rules
//! in priority order (highest first, ties by creation time) and, for each
//! rule whose trigger and conditions match, atomically claims a firing
//! (cooldown and execution cap), runs the action list and appends one audit
//! record. Rules fire one after another, never interleaved.

use std::sync::Arc;

use supportflow_store::{
    Database, DirectoryStore, ExecutionLogStore, ExecutionRecord, Rule, RuleStore,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::context::TriggerContext;
use crate::error::{EngineError, Result};
use crate::executor::{ActionExecutor, ExecutionResult};
use crate::handlers::{HandlerDeps, register_builtins};
use crate::logger::ExecutionLogger;
use crate::matcher::TriggerMatcher;
use crate::ports::{AiResponder, MessageChannel};
use crate::registry::{ActionHandler, HandlerRegistry};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Results of one rule firing.
#[derive(Debug, Clone)]
pub struct RuleFiring {
    pub rule_id: String,
    pub rule_name: String,
    pub results: Vec<ExecutionResult>,
    /// The audit record, `None` if it could not be persisted.
    pub record: Option<ExecutionRecord>,
}

struct EngineInner {
    rules: RuleStore,
    directory: DirectoryStore,
    matcher: TriggerMatcher,
    executor: ActionExecutor,
    logger: ExecutionLogger,
    registry: HandlerRegistry,
    config: EngineConfig,
}

/// Cheap-to-clone handle to the automation engine.
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`AutomationEngine`] from a database and collaborators.
pub struct EngineBuilder {
    db: Database,
    config: EngineConfig,
    channel: Option<Arc<dyn MessageChannel>>,
    ai: Option<Arc<dyn AiResponder>>,
    extra_handlers: Vec<Arc<dyn ActionHandler>>,
}

impl EngineBuilder {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: EngineConfig::default(),
            channel: None,
            ai: None,
            extra_handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn ai_responder(mut self, ai: Arc<dyn AiResponder>) -> Self {
        self.ai = Some(ai);
        self
    }

    /// Register a custom handler; it replaces a built-in with the same tag.
    pub fn handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn build(self) -> AutomationEngine {
        let directory = DirectoryStore::new(self.db.clone());
        let registry = HandlerRegistry::new();
        register_builtins(
            &registry,
            &HandlerDeps {
                directory: directory.clone(),
                config: self.config.clone(),
                channel: self.channel,
                ai: self.ai,
            },
        );
        for handler in self.extra_handlers {
            registry.register(handler);
        }
        info!(handlers = ?registry.action_types(), "automation engine ready");

        AutomationEngine {
            inner: Arc::new(EngineInner {
                rules: RuleStore::new(self.db.clone()),
                matcher: TriggerMatcher::new(directory.clone(), self.config.clone()),
                executor: ActionExecutor::new(registry.clone(), self.config.clone()),
                logger: ExecutionLogger::new(ExecutionLogStore::new(self.db)),
                directory,
                registry,
                config: self.config,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl AutomationEngine {
    pub fn builder(db: Database) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    /// Match `ctx` against every active rule and fire the matching ones in
    /// priority order, returning the action results of all firings
    /// flattened in firing order.
    ///
    /// Only a failure to load the rule list is returned as an error; each
    /// action failure is carried in its [`ExecutionResult`].
    pub async fn process_trigger(&self, ctx: &TriggerContext) -> Result<Vec<ExecutionResult>> {
        let firings = self.dispatch(ctx).await?;
        Ok(firings.into_iter().flat_map(|f| f.results).collect())
    }

    /// Like [`process_trigger`](Self::process_trigger) but keeps results
    /// grouped per fired rule together with the audit records.
    #[instrument(skip(self, ctx), fields(event = %ctx.event_type))]
    pub async fn dispatch(&self, ctx: &TriggerContext) -> Result<Vec<RuleFiring>> {
        let mut rules = self.inner.rules.list_active().await?;
        // The store already orders by priority; keep it explicit and stable.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut firings = Vec::new();
        for rule in &rules {
            if !self.inner.matcher.matches(rule, ctx).await {
                continue;
            }
            match self.inner.rules.try_claim(&rule.id, ctx.timestamp).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(rule_id = %rule.id, "rule matched but is cooling down or capped");
                    continue;
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "could not claim rule firing");
                    continue;
                }
            }
            firings.push(self.run_rule(rule, ctx).await);
        }

        if firings.is_empty() {
            debug!(rules = rules.len(), "no rule fired");
        }
        Ok(firings)
    }

    /// Fire one rule regardless of its trigger, conditions and cooldown.
    ///
    /// The rule must exist, be active and be below its execution cap.
    #[instrument(skip(self, ctx))]
    pub async fn fire_rule(&self, rule_id: &str, ctx: &TriggerContext) -> Result<RuleFiring> {
        let rule = self
            .inner
            .rules
            .get(rule_id)
            .await?
            .ok_or_else(|| EngineError::RuleNotFound {
                rule_id: rule_id.to_string(),
            })?;
        if !rule.is_active() {
            return Err(EngineError::RuleNotActive {
                rule_id: rule.id,
                status: rule.status.to_string(),
            });
        }
        if !self.inner.rules.claim_forced(&rule.id, ctx.timestamp).await? {
            return Err(EngineError::ExecutionLimitReached { rule_id: rule.id });
        }
        Ok(self.run_rule(&rule, ctx).await)
    }

    async fn run_rule(&self, rule: &Rule, ctx: &TriggerContext) -> RuleFiring {
        let started = Instant::now();
        let results = self.inner.executor.execute(&rule.actions, ctx).await;
        let elapsed = started.elapsed();

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            rule_id = %rule.id,
            rule = %rule.name,
            succeeded,
            failed = results.len() - succeeded,
            elapsed_ms = elapsed.as_millis() as u64,
            "rule fired"
        );

        let record = self.inner.logger.record(rule, ctx, &results, elapsed).await;
        RuleFiring {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            results,
            record,
        }
    }

    // -- accessors -----------------------------------------------------------

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn rules(&self) -> &RuleStore {
        &self.inner.rules
    }

    pub fn directory(&self) -> &DirectoryStore {
        &self.inner.directory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}
