//! Rule persistence.
//!
//! A rule couples a trigger type (plus its JSON configuration), optional
//! JSON conditions and an ordered action list. The runtime counters
//! (`execution_count`, `last_executed_at`) are only ever changed through
//! [`RuleStore::try_claim`] and [`RuleStore::claim_forced`], which check
//! eligibility and bump the counters in a single SQL statement so two
//! concurrent firings of the same rule cannot both pass the cooldown.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle status of a rule. Only `Active` rules are ever evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Draft,
    Active,
    Paused,
    Disabled,
}

impl RuleStatus {
    /// Parse the database / CLI representation.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown rule status: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of event classes a rule can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Keyword,
    TimeBased,
    MessageCount,
    UserStatus,
    ConversationInactive,
    Escalation,
    CustomEvent,
    /// Synthesized by the scheduler, never sent by external callers.
    ScheduledExecution,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 8] = [
        Self::Keyword,
        Self::TimeBased,
        Self::MessageCount,
        Self::UserStatus,
        Self::ConversationInactive,
        Self::Escalation,
        Self::CustomEvent,
        Self::ScheduledExecution,
    ];

    pub fn parse(s: &str) -> StoreResult<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown trigger type: {s}")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::TimeBased => "time_based",
            Self::MessageCount => "message_count",
            Self::UserStatus => "user_status",
            Self::ConversationInactive => "conversation_inactive",
            Self::Escalation => "escalation",
            Self::CustomEvent => "custom_event",
            Self::ScheduledExecution => "scheduled_execution",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a rule's ordered action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action-type tag resolved through the handler registry.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Seconds to wait before this action runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            action_type: action_type.into(),
            config,
            delay: None,
        }
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }
}

/// A persisted automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// UUID v7.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: RuleStatus,
    pub trigger_type: TriggerKind,
    /// Interpreted by the matcher branch for `trigger_type`.
    pub trigger_config: serde_json::Value,
    /// `None` means always satisfied.
    pub conditions: Option<serde_json::Value>,
    pub actions: Vec<ActionSpec>,
    /// Higher runs first.
    pub priority: i64,
    /// 0 disables the cooldown.
    pub cooldown_minutes: i64,
    /// Lifetime cap on firings, `None` for unlimited.
    pub max_executions: Option<i64>,
    pub execution_count: i64,
    /// Unix seconds of the last firing.
    pub last_executed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Rule {
    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }
}

/// Everything needed to create or redefine a rule.
///
/// Deserializable so rule sets can be imported from JSON files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_status")]
    pub status: RuleStatus,
    pub trigger_type: TriggerKind,
    #[serde(default = "empty_object")]
    pub trigger_config: serde_json::Value,
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub max_executions: Option<i64>,
}

fn default_status() -> RuleStatus {
    RuleStatus::Draft
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewRule {
    /// A draft rule with no actions; fill in the rest with struct update syntax.
    pub fn new(name: impl Into<String>, trigger_type: TriggerKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            status: RuleStatus::Draft,
            trigger_type,
            trigger_config: empty_object(),
            conditions: None,
            actions: Vec::new(),
            priority: 0,
            cooldown_minutes: 0,
            max_executions: None,
        }
    }

    fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("rule name is empty".into()));
        }
        if self.status == RuleStatus::Active && self.actions.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "active rule '{}' must have at least one action",
                self.name
            )));
        }
        if self.cooldown_minutes < 0 {
            return Err(StoreError::InvalidArgument(
                "cooldown_minutes must not be negative".into(),
            ));
        }
        if matches!(self.max_executions, Some(n) if n < 0) {
            return Err(StoreError::InvalidArgument(
                "max_executions must not be negative".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  RuleStore
// ═══════════════════════════════════════════════════════════════════════

const RULE_COLUMNS: &str = "id, name, description, status, trigger_type, trigger_config, conditions, \
     actions, priority, cooldown_minutes, max_executions, execution_count, last_executed_at, \
     created_at, updated_at";

/// CRUD and counter bookkeeping for rules.
#[derive(Clone)]
pub struct RuleStore {
    db: Database,
}

impl RuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new rule with zeroed counters.
    #[instrument(skip(self, rule), fields(rule_name = %rule.name))]
    pub async fn create(&self, rule: NewRule) -> StoreResult<Rule> {
        rule.validate()?;

        let now = Utc::now().timestamp();
        let stored = Rule {
            id: Uuid::now_v7().to_string(),
            name: rule.name,
            description: rule.description,
            status: rule.status,
            trigger_type: rule.trigger_type,
            trigger_config: rule.trigger_config,
            conditions: rule.conditions,
            actions: rule.actions,
            priority: rule.priority,
            cooldown_minutes: rule.cooldown_minutes,
            max_executions: rule.max_executions,
            execution_count: 0,
            last_executed_at: None,
            created_at: now,
            updated_at: now,
        };

        let id = stored.id.clone();
        let name = stored.name.clone();
        let description = stored.description.clone();
        let status = stored.status.as_str();
        let trigger_type = stored.trigger_type.as_str();
        let trigger_json = serde_json::to_string(&stored.trigger_config)?;
        let conditions_json = stored
            .conditions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let actions_json = serde_json::to_string(&stored.actions)?;
        let priority = stored.priority;
        let cooldown = stored.cooldown_minutes;
        let max_executions = stored.max_executions;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO rules (id, name, description, status, trigger_type, trigger_config, \
                     conditions, actions, priority, cooldown_minutes, max_executions, execution_count, \
                     last_executed_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, ?12, ?12)",
                    rusqlite::params![
                        id,
                        name,
                        description,
                        status,
                        trigger_type,
                        trigger_json,
                        conditions_json,
                        actions_json,
                        priority,
                        cooldown,
                        max_executions,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(rule_id = %stored.id, trigger = %stored.trigger_type, "rule created");
        Ok(stored)
    }

    /// Fetch a rule by ID, `None` if it does not exist.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<Rule>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                    rusqlite::params![id],
                    RuleRow::from_row,
                );
                match result {
                    Ok(row) => row.into_rule().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// All rules, highest priority first, then oldest first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<Rule>> {
        self.query_rules("1 = 1").await
    }

    /// Active rules in load order (creation order).
    ///
    /// The dispatcher applies its own stable priority sort on top of this.
    #[instrument(skip(self))]
    pub async fn list_active(&self) -> StoreResult<Vec<Rule>> {
        self.query_rules("status = 'active'").await
    }

    async fn query_rules(&self, filter: &'static str) -> StoreResult<Vec<Rule>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE {filter} \
                     ORDER BY priority DESC, created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([], RuleRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(RuleRow::into_rule).collect()
            })
            .await
    }

    /// Replace a rule's definition. Counters are left untouched.
    #[instrument(skip(self, rule))]
    pub async fn update(&self, id: &str, rule: NewRule) -> StoreResult<()> {
        rule.validate()?;

        let id = id.to_string();
        let now = Utc::now().timestamp();
        let trigger_json = serde_json::to_string(&rule.trigger_config)?;
        let conditions_json = rule
            .conditions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let actions_json = serde_json::to_string(&rule.actions)?;

        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE rules SET name = ?2, description = ?3, status = ?4, trigger_type = ?5, \
                     trigger_config = ?6, conditions = ?7, actions = ?8, priority = ?9, \
                     cooldown_minutes = ?10, max_executions = ?11, updated_at = ?12 \
                     WHERE id = ?1",
                    rusqlite::params![
                        id,
                        rule.name,
                        rule.description,
                        rule.status.as_str(),
                        rule.trigger_type.as_str(),
                        trigger_json,
                        conditions_json,
                        actions_json,
                        rule.priority,
                        rule.cooldown_minutes,
                        rule.max_executions,
                        now
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound { entity: "rule", id });
                }
                Ok(())
            })
            .await
    }

    /// Move a rule to another lifecycle status.
    ///
    /// Activating a rule whose action list is empty is refused.
    #[instrument(skip(self))]
    pub async fn set_status(&self, id: &str, status: RuleStatus) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let actions: String = match conn.query_row(
                    "SELECT actions FROM rules WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                ) {
                    Ok(actions) => actions,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(StoreError::NotFound { entity: "rule", id });
                    }
                    Err(e) => return Err(e.into()),
                };

                if status == RuleStatus::Active {
                    let parsed: Vec<ActionSpec> = serde_json::from_str(&actions)?;
                    if parsed.is_empty() {
                        return Err(StoreError::InvalidArgument(format!(
                            "rule {id} has no actions and cannot be activated"
                        )));
                    }
                }

                conn.execute(
                    "UPDATE rules SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), now],
                )?;
                debug!(rule_id = %id, status = %status, "rule status changed");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM rules WHERE id = ?1", rusqlite::params![id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound { entity: "rule", id });
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
    }

    /// Atomically claim a firing of rule `id` at instant `now` (Unix seconds).
    ///
    /// Succeeds only if the rule is active, out of cooldown and below its
    /// `max_executions` cap; on success `execution_count` is incremented and
    /// `last_executed_at` set to `now` in the same statement. Returns
    /// `false` when any eligibility check fails.
    #[instrument(skip(self))]
    pub async fn try_claim(&self, id: &str, now: i64) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let claimed = conn.execute(
                    "UPDATE rules \
                     SET execution_count = execution_count + 1, last_executed_at = ?2 \
                     WHERE id = ?1 AND status = 'active' \
                       AND (max_executions IS NULL OR execution_count < max_executions) \
                       AND (cooldown_minutes <= 0 OR last_executed_at IS NULL \
                            OR ?2 - last_executed_at >= cooldown_minutes * 60)",
                    rusqlite::params![id, now],
                )?;
                Ok(claimed == 1)
            })
            .await
    }

    /// Claim a firing ignoring the cooldown window.
    ///
    /// Still requires the rule to be active and below its `max_executions`
    /// cap. Used for operator-initiated test firings.
    #[instrument(skip(self))]
    pub async fn claim_forced(&self, id: &str, now: i64) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let claimed = conn.execute(
                    "UPDATE rules \
                     SET execution_count = execution_count + 1, last_executed_at = ?2 \
                     WHERE id = ?1 AND status = 'active' \
                       AND (max_executions IS NULL OR execution_count < max_executions)",
                    rusqlite::params![id, now],
                )?;
                Ok(claimed == 1)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row before enum parsing and JSON decoding, which can fail with a
/// `StoreError` rather than a `rusqlite::Error`.
struct RuleRow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    trigger_type: String,
    trigger_config: String,
    conditions: Option<String>,
    actions: String,
    priority: i64,
    cooldown_minutes: i64,
    max_executions: Option<i64>,
    execution_count: i64,
    last_executed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RuleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            trigger_type: row.get(4)?,
            trigger_config: row.get(5)?,
            conditions: row.get(6)?,
            actions: row.get(7)?,
            priority: row.get(8)?,
            cooldown_minutes: row.get(9)?,
            max_executions: row.get(10)?,
            execution_count: row.get(11)?,
            last_executed_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_rule(self) -> StoreResult<Rule> {
        Ok(Rule {
            status: RuleStatus::parse(&self.status)?,
            trigger_type: TriggerKind::parse(&self.trigger_type)?,
            trigger_config: serde_json::from_str(&self.trigger_config)?,
            conditions: self
                .conditions
                .map(|c| serde_json::from_str(&c))
                .transpose()?,
            actions: serde_json::from_str(&self.actions)?,
            id: self.id,
            name: self.name,
            description: self.description,
            priority: self.priority,
            cooldown_minutes: self.cooldown_minutes,
            max_executions: self.max_executions,
            execution_count: self.execution_count,
            last_executed_at: self.last_executed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
