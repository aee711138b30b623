//! Trigger matching.
//!
//! [`TriggerMatcher::matches`] answers "does this rule react to this
//! event?" It is a closed switch over [`TriggerKind`], followed by the
//! rule's conditions. Matching only reads: message counts, user status and
//! last activity come from the [`DirectoryStore`], and "now" is always the
//! context timestamp, so repeated calls with the same inputs agree.
//!
//! Each branch narrows the rule's JSON `trigger_config` into a typed
//! struct first. A malformed configuration is logged and treated as a
//! non-match.

use aho_corasick::AhoCorasick;
use chrono::DateTime;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use supportflow_store::{DirectoryStore, Rule, TriggerKind};
use tracing::{debug, warn};

use crate::conditions::{Audience, Conditions};
use crate::config::EngineConfig;
use crate::context::{ESCALATION_NEEDED, SCHEDULED_EXECUTION, TriggerContext};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Trigger configurations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KeywordConfig {
    keywords: Vec<String>,
    #[serde(default)]
    match_mode: MatchMode,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MatchMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Default, Deserialize)]
struct TimeBasedConfig {
    tolerance_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessageCountConfig {
    operator: CountOperator,
    value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum CountOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=", alias = "==")]
    Eq,
}

impl CountOperator {
    fn holds(self, actual: i64, expected: i64) -> bool {
        match self {
            Self::Gt => actual > expected,
            Self::Gte => actual >= expected,
            Self::Lt => actual < expected,
            Self::Lte => actual <= expected,
            Self::Eq => actual == expected,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserStatusConfig {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct InactivityConfig {
    minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CustomEventConfig {
    event_name: String,
    #[serde(default)]
    payload: Option<Value>,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TriggerMatcher {
    directory: DirectoryStore,
    config: EngineConfig,
}

impl TriggerMatcher {
    pub fn new(directory: DirectoryStore, config: EngineConfig) -> Self {
        Self { directory, config }
    }

    /// Trigger-type match AND conditions match.
    ///
    /// Inactive rules never match. Configuration and lookup errors are
    /// logged and count as "no match".
    pub async fn matches(&self, rule: &Rule, ctx: &TriggerContext) -> bool {
        if !rule.is_active() {
            return false;
        }
        match self.try_match(rule, ctx).await {
            Ok(matched) => {
                debug!(rule_id = %rule.id, trigger = %rule.trigger_type, matched, "rule evaluated");
                matched
            }
            Err(e) => {
                warn!(rule_id = %rule.id, trigger = %rule.trigger_type, error = %e, "rule skipped");
                false
            }
        }
    }

    async fn try_match(&self, rule: &Rule, ctx: &TriggerContext) -> Result<bool> {
        if !self.trigger_matches(rule, ctx).await? {
            return Ok(false);
        }
        match &rule.conditions {
            None => Ok(true),
            Some(raw) => self.conditions_hold(raw, ctx).await,
        }
    }

    /// The trigger-type half of the match.
    pub async fn trigger_matches(&self, rule: &Rule, ctx: &TriggerContext) -> Result<bool> {
        match rule.trigger_type {
            TriggerKind::Keyword => {
                let cfg: KeywordConfig = narrow(rule)?;
                Ok(ctx
                    .message_text()
                    .is_some_and(|text| keywords_match(&cfg.keywords, cfg.match_mode, text)))
            }
            TriggerKind::TimeBased => {
                if is_schedule_for(rule, ctx) {
                    return Ok(true);
                }
                let cfg: TimeBasedConfig = narrow_or_default(rule)?;
                let tolerance = cfg
                    .tolerance_seconds
                    .unwrap_or(self.config.time_based_tolerance())
                    .clamp(0, 60);
                Ok(target_time(&ctx.data)
                    .is_some_and(|target| target.abs_diff(ctx.timestamp) <= tolerance as u64))
            }
            TriggerKind::MessageCount => {
                let cfg: MessageCountConfig = narrow(rule)?;
                let Some(conversation_id) = &ctx.conversation_id else {
                    return Ok(false);
                };
                let count = self.directory.message_count(conversation_id).await?;
                Ok(cfg.operator.holds(count, cfg.value))
            }
            TriggerKind::UserStatus => {
                let cfg: UserStatusConfig = narrow(rule)?;
                let Some(user_id) = &ctx.user_id else {
                    return Ok(false);
                };
                Ok(self
                    .directory
                    .get_user(user_id)
                    .await?
                    .is_some_and(|user| user.status == cfg.status))
            }
            TriggerKind::ConversationInactive => {
                let cfg: InactivityConfig = narrow_or_default(rule)?;
                let minutes = cfg
                    .minutes
                    .unwrap_or(self.config.default_inactivity_minutes);
                let Some(conversation_id) = &ctx.conversation_id else {
                    return Ok(false);
                };
                Ok(self
                    .directory
                    .last_message_at(conversation_id)
                    .await?
                    .is_some_and(|last| {
                        ctx.timestamp.saturating_sub(last) >= minutes.saturating_mul(60)
                    }))
            }
            TriggerKind::Escalation => {
                Ok(ctx.event_type == ESCALATION_NEEDED || ctx.event_type == "escalation")
            }
            TriggerKind::CustomEvent => {
                let cfg: CustomEventConfig = narrow(rule)?;
                if ctx.event_type != cfg.event_name {
                    return Ok(false);
                }
                Ok(match &cfg.payload {
                    None => true,
                    Some(expected) => {
                        let actual = ctx.data.get("payload").unwrap_or(&ctx.data);
                        actual == expected
                    }
                })
            }
            TriggerKind::ScheduledExecution => Ok(ctx.event_type == SCHEDULED_EXECUTION
                && ctx
                    .data
                    .get("rule_id")
                    .and_then(Value::as_str)
                    .is_none_or(|target| target == rule.id)),
        }
    }

    async fn conditions_hold(&self, raw: &Value, ctx: &TriggerContext) -> Result<bool> {
        let conditions = Conditions::parse(raw)?;

        let mut audience = Audience::default();
        if conditions.needs_audience() {
            if let Some(user_id) = &ctx.user_id {
                audience.user = self.directory.get_user(user_id).await?;
            }
            if let Some(conversation_id) = &ctx.conversation_id
                && let Some(conversation) = self.directory.get_conversation(conversation_id).await?
            {
                audience.conversation_tags = conversation.tags;
            }
        }

        Ok(conditions.evaluate(ctx, &audience))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn narrow<T: DeserializeOwned>(rule: &Rule) -> Result<T> {
    serde_json::from_value(rule.trigger_config.clone()).map_err(|e| {
        EngineError::InvalidTriggerConfig {
            trigger: rule.trigger_type.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Like [`narrow`] but an absent (null / `{}`) config yields the default.
fn narrow_or_default<T: DeserializeOwned + Default>(rule: &Rule) -> Result<T> {
    if rule.trigger_config.is_null() {
        return Ok(T::default());
    }
    narrow(rule)
}

/// A scheduler firing aimed at this particular rule.
fn is_schedule_for(rule: &Rule, ctx: &TriggerContext) -> bool {
    ctx.event_type == SCHEDULED_EXECUTION
        && ctx.data.get("rule_id").and_then(Value::as_str) == Some(rule.id.as_str())
}

/// Case-insensitive substring search for any (or all) keywords.
fn keywords_match(keywords: &[String], mode: MatchMode, text: &str) -> bool {
    let patterns: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if patterns.is_empty() {
        return false;
    }
    let Ok(automaton) = AhoCorasick::new(&patterns) else {
        return false;
    };
    let haystack = text.to_lowercase();

    match mode {
        MatchMode::Any => automaton.is_match(&haystack),
        MatchMode::All => {
            let mut seen = vec![false; patterns.len()];
            for found in automaton.find_overlapping_iter(&haystack) {
                seen[found.pattern().as_usize()] = true;
            }
            seen.into_iter().all(|hit| hit)
        }
    }
}

/// `data.target_time` as Unix seconds, from RFC 3339 or an integer.
fn target_time(data: &Value) -> Option<i64> {
    match data.get("target_time")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use supportflow_store::{ActionSpec, Database, MessageSender, NewUser, RuleStatus};

    async fn setup() -> (TriggerMatcher, DirectoryStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let directory = DirectoryStore::new(db);
        (
            TriggerMatcher::new(directory.clone(), EngineConfig::default()),
            directory,
        )
    }

    fn make_rule(trigger_type: TriggerKind, trigger_config: Value) -> Rule {
        Rule {
            id: "rule-1".into(),
            name: "test".into(),
            description: None,
            status: RuleStatus::Active,
            trigger_type,
            trigger_config,
            conditions: None,
            actions: vec![ActionSpec::new("delay", json!({"seconds": 0}))],
            priority: 0,
            cooldown_minutes: 0,
            max_executions: None,
            execution_count: 0,
            last_executed_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn message(text: &str) -> TriggerContext {
        TriggerContext::new("message_received", json!({ "text": text }))
    }

    async fn conversation_with_messages(directory: &DirectoryStore, count: usize) -> (String, String) {
        let user = directory
            .create_user(NewUser {
                display_name: None,
                platform: "telegram".into(),
                platform_address: "1".into(),
                status: "active".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let conversation = directory.open_conversation(&user.id).await.unwrap();
        for i in 0..count {
            directory
                .append_message(
                    &conversation.id,
                    MessageSender::User,
                    "hi",
                    json!({}),
                    1_000 + i as i64,
                )
                .await
                .unwrap();
        }
        (user.id, conversation.id)
    }

    #[tokio::test]
    async fn keyword_scenario() {
        let (matcher, _) = setup().await;
        let rule = make_rule(TriggerKind::Keyword, json!({"keywords": ["refund"]}));

        assert!(matcher.matches(&rule, &message("I want a refund please")).await);
        assert!(!matcher.matches(&rule, &message("no issues here")).await);
        assert!(matcher.matches(&rule, &message("REFUND NOW")).await);
    }

    #[tokio::test]
    async fn keyword_all_mode_and_unicode() {
        let (matcher, _) = setup().await;
        let rule = make_rule(
            TriggerKind::Keyword,
            json!({"keywords": ["Возврат", "деньги"], "match_mode": "all"}),
        );

        assert!(matcher.matches(&rule, &message("верните деньги, нужен возврат")).await);
        assert!(!matcher.matches(&rule, &message("нужен возврат")).await);
    }

    #[tokio::test]
    async fn keyword_without_text_or_keywords_never_matches() {
        let (matcher, _) = setup().await;
        let with_keywords = make_rule(TriggerKind::Keyword, json!({"keywords": ["refund"]}));
        assert!(
            !matcher
                .matches(&with_keywords, &TriggerContext::new("message_received", json!({})))
                .await
        );

        let empty = make_rule(TriggerKind::Keyword, json!({"keywords": ["", "  "]}));
        assert!(!matcher.matches(&empty, &message("anything")).await);
    }

    #[tokio::test]
    async fn malformed_config_is_a_non_match() {
        let (matcher, _) = setup().await;
        let rule = make_rule(TriggerKind::Keyword, json!({"words": ["refund"]}));
        assert!(!matcher.matches(&rule, &message("refund")).await);
        let err = matcher.trigger_matches(&rule, &message("refund")).await.unwrap_err();
        assert!(
            matches!(&err, EngineError::InvalidTriggerConfig { trigger, .. } if trigger == "keyword"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn message_count_scenario() {
        let (matcher, directory) = setup().await;
        let rule = make_rule(TriggerKind::MessageCount, json!({"operator": ">=", "value": 5}));

        let (_, five) = conversation_with_messages(&directory, 5).await;
        let (_, four) = conversation_with_messages(&directory, 4).await;

        let ctx = |conversation: &str| {
            TriggerContext::new("message_received", json!({})).with_conversation(conversation)
        };
        assert!(matcher.matches(&rule, &ctx(&five)).await);
        assert!(!matcher.matches(&rule, &ctx(&four)).await);
    }

    #[tokio::test]
    async fn message_count_equality_alias() {
        let (matcher, directory) = setup().await;
        let rule = make_rule(TriggerKind::MessageCount, json!({"operator": "==", "value": 2}));
        let (_, conversation) = conversation_with_messages(&directory, 2).await;
        let ctx = TriggerContext::new("message_received", json!({})).with_conversation(conversation);
        assert!(matcher.matches(&rule, &ctx).await);
    }

    #[tokio::test]
    async fn user_status_reads_current_status() {
        let (matcher, directory) = setup().await;
        let (user_id, _) = conversation_with_messages(&directory, 0).await;
        let rule = make_rule(TriggerKind::UserStatus, json!({"status": "vip"}));
        let ctx = TriggerContext::new("user_status_changed", json!({})).with_user(&user_id);

        assert!(!matcher.matches(&rule, &ctx).await);
        directory
            .update_user_status(&user_id, "vip", "status_change", json!({}))
            .await
            .unwrap();
        assert!(matcher.matches(&rule, &ctx).await);
    }

    #[tokio::test]
    async fn conversation_inactive_uses_context_time() {
        let (matcher, directory) = setup().await;
        // Last message at t = 1_000.
        let (_, conversation) = conversation_with_messages(&directory, 1).await;
        let rule = make_rule(TriggerKind::ConversationInactive, json!({}));

        let at = |t: i64| {
            TriggerContext::new("conversation_inactive", json!({}))
                .with_conversation(&conversation)
                .at(t)
        };
        assert!(!matcher.matches(&rule, &at(1_000 + 29 * 60)).await);
        assert!(matcher.matches(&rule, &at(1_000 + 30 * 60)).await);

        let custom = make_rule(TriggerKind::ConversationInactive, json!({"minutes": 5}));
        assert!(matcher.matches(&custom, &at(1_000 + 5 * 60)).await);

        let (_, empty) = conversation_with_messages(&directory, 0).await;
        let ctx = TriggerContext::new("conversation_inactive", json!({}))
            .with_conversation(empty)
            .at(1_000_000);
        assert!(!matcher.matches(&rule, &ctx).await);
    }

    #[tokio::test]
    async fn time_based_tolerance() {
        let (matcher, _) = setup().await;
        let rule = make_rule(TriggerKind::TimeBased, json!({}));
        let ctx = |target: Value| TriggerContext::new("tick", json!({"target_time": target})).at(1_000);

        assert!(matcher.matches(&rule, &ctx(json!(1_030))).await);
        assert!(matcher.matches(&rule, &ctx(json!(940))).await);
        assert!(!matcher.matches(&rule, &ctx(json!(1_061))).await);
        assert!(
            matcher
                .matches(&rule, &ctx(json!("1970-01-01T00:16:40Z")))
                .await
        );

        let wide = make_rule(TriggerKind::TimeBased, json!({"tolerance_seconds": 3600}));
        assert!(!matcher.matches(&wide, &ctx(json!(1_100))).await);
    }

    #[tokio::test]
    async fn time_based_extreme_targets_do_not_match() {
        let (matcher, _) = setup().await;
        let rule = make_rule(TriggerKind::TimeBased, json!({}));

        for (now, target) in [(1_000, i64::MIN), (1_000, i64::MAX), (i64::MIN, i64::MAX)] {
            let ctx = TriggerContext::new("time_tick", json!({"target_time": target})).at(now);
            assert!(!matcher.matches(&rule, &ctx).await);
        }
        let ctx = TriggerContext::new("time_tick", json!({"target_time": i64::MIN})).at(i64::MIN);
        assert!(matcher.matches(&rule, &ctx).await);
    }

    #[tokio::test]
    async fn inactivity_saturates_on_extreme_values() {
        let (matcher, directory) = setup().await;
        let (_, conversation) = conversation_with_messages(&directory, 1).await;

        let huge = make_rule(TriggerKind::ConversationInactive, json!({"minutes": i64::MAX}));
        let ctx = TriggerContext::new("conversation_inactive", json!({}))
            .with_conversation(&conversation)
            .at(i64::MAX);
        assert!(!matcher.matches(&huge, &ctx).await);

        let rule = make_rule(TriggerKind::ConversationInactive, json!({}));
        let ctx = TriggerContext::new("conversation_inactive", json!({}))
            .with_conversation(&conversation)
            .at(i64::MIN);
        assert!(!matcher.matches(&rule, &ctx).await);
    }

    #[tokio::test]
    async fn escalation_and_custom_event() {
        let (matcher, _) = setup().await;
        let escalation = make_rule(TriggerKind::Escalation, Value::Null);
        assert!(
            matcher
                .matches(&escalation, &TriggerContext::escalation_needed("u", "c", "angry"))
                .await
        );
        assert!(!matcher.matches(&escalation, &message("help")).await);

        let shipped = make_rule(
            TriggerKind::CustomEvent,
            json!({"event_name": "order_shipped", "payload": {"carrier": "dhl"}}),
        );
        assert!(
            matcher
                .matches(&shipped, &TriggerContext::custom_event("order_shipped", json!({"carrier": "dhl"})))
                .await
        );
        assert!(
            !matcher
                .matches(&shipped, &TriggerContext::custom_event("order_shipped", json!({"carrier": "ups"})))
                .await
        );
        assert!(
            !matcher
                .matches(&shipped, &TriggerContext::custom_event("order_lost", json!({"carrier": "dhl"})))
                .await
        );
    }

    #[tokio::test]
    async fn scheduled_execution_targets_its_rule() {
        let (matcher, _) = setup().await;
        let scheduled = make_rule(TriggerKind::ScheduledExecution, Value::Null);

        assert!(
            matcher
                .matches(&scheduled, &TriggerContext::scheduled_execution("rule-1", "s", 0))
                .await
        );
        assert!(
            !matcher
                .matches(&scheduled, &TriggerContext::scheduled_execution("rule-2", "s", 0))
                .await
        );
        assert!(
            matcher
                .matches(&scheduled, &TriggerContext::new(SCHEDULED_EXECUTION, json!({})))
                .await
        );

        let time_based = make_rule(TriggerKind::TimeBased, json!({}));
        assert!(
            matcher
                .matches(&time_based, &TriggerContext::scheduled_execution("rule-1", "s", 0))
                .await
        );
    }

    #[tokio::test]
    async fn inactive_rules_never_match() {
        let (matcher, _) = setup().await;
        let mut paused = make_rule(TriggerKind::Keyword, json!({"keywords": ["refund"]}));
        paused.status = RuleStatus::Paused;
        assert!(!matcher.matches(&paused, &message("refund")).await);
    }

    #[tokio::test]
    async fn conditions_gate_after_trigger() {
        let (matcher, directory) = setup().await;
        let (user_id, conversation_id) = conversation_with_messages(&directory, 1).await;
        let mut gated = make_rule(TriggerKind::Keyword, json!({"keywords": ["refund"]}));
        gated.conditions = Some(json!({"user_statuses": ["vip"]}));

        let ctx = TriggerContext::message_received(&user_id, &conversation_id, "m", "refund");
        assert!(!matcher.matches(&gated, &ctx).await);

        directory
            .update_user_status(&user_id, "vip", "status_change", json!({}))
            .await
            .unwrap();
        assert!(matcher.matches(&gated, &ctx).await);
    }

    #[tokio::test]
    async fn matching_is_idempotent() {
        let (matcher, directory) = setup().await;
        let (_, conversation) = conversation_with_messages(&directory, 3).await;
        let rule = make_rule(TriggerKind::MessageCount, json!({"operator": ">", "value": 2}));
        let ctx = TriggerContext::new("message_received", json!({})).with_conversation(conversation);

        let first = matcher.matches(&rule, &ctx).await;
        let second = matcher.matches(&rule, &ctx).await;
        assert_eq!(first, second);
        assert_eq!(directory.message_count(ctx.conversation_id.as_deref().unwrap()).await.unwrap(), 3);
    }
}
