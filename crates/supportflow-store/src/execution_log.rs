//! Append-only audit trail of rule firings.
//!
//! Each firing produces exactly one [`ExecutionRecord`]. There is no
//! update or delete path; records are facts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::rule_store::ActionSpec;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Aggregate outcome of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Every action succeeded.
    Success,
    /// At least one action failed and at least one succeeded.
    Partial,
    /// No action succeeded.
    Failed,
}

impl ExecutionStatus {
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown execution status: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The data of a firing, before the store assigns an id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecutionRecord {
    pub rule_id: String,
    pub trigger_type: String,
    pub trigger_data: serde_json::Value,
    pub actions: Vec<ActionSpec>,
    /// Serialized per-action results, in action order.
    pub results: serde_json::Value,
    pub status: ExecutionStatus,
    /// First error message among the results.
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

/// A persisted audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub rule_id: String,
    pub trigger_type: String,
    pub trigger_data: serde_json::Value,
    pub actions: Vec<ActionSpec>,
    pub results: serde_json::Value,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  ExecutionLogStore
// ═══════════════════════════════════════════════════════════════════════

const RECORD_COLUMNS: &str = "id, rule_id, trigger_type, trigger_data, actions, results, status, \
     error_message, execution_time_ms, user_id, conversation_id, message_id, created_at";

#[derive(Clone)]
pub struct ExecutionLogStore {
    db: Database,
}

impl ExecutionLogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record and return it with its assigned id.
    #[instrument(skip(self, record), fields(rule_id = %record.rule_id, status = %record.status))]
    pub async fn append(&self, record: NewExecutionRecord) -> StoreResult<ExecutionRecord> {
        let stored = ExecutionRecord {
            id: Uuid::now_v7().to_string(),
            rule_id: record.rule_id,
            trigger_type: record.trigger_type,
            trigger_data: record.trigger_data,
            actions: record.actions,
            results: record.results,
            status: record.status,
            error_message: record.error_message,
            execution_time_ms: record.execution_time_ms,
            user_id: record.user_id,
            conversation_id: record.conversation_id,
            message_id: record.message_id,
            created_at: Utc::now().timestamp(),
        };

        let trigger_json = serde_json::to_string(&stored.trigger_data)?;
        let actions_json = serde_json::to_string(&stored.actions)?;
        let results_json = serde_json::to_string(&stored.results)?;
        let row = stored.clone();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO rule_executions (id, rule_id, trigger_type, trigger_data, actions, \
                     results, status, error_message, execution_time_ms, user_id, conversation_id, \
                     message_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        row.id,
                        row.rule_id,
                        row.trigger_type,
                        trigger_json,
                        actions_json,
                        results_json,
                        row.status.as_str(),
                        row.error_message,
                        row.execution_time_ms,
                        row.user_id,
                        row.conversation_id,
                        row.message_id,
                        row.created_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(record_id = %stored.id, "execution record appended");
        Ok(stored)
    }

    /// Most recent records for one rule, newest first.
    #[instrument(skip(self))]
    pub async fn recent_for_rule(&self, rule_id: &str, limit: i64) -> StoreResult<Vec<ExecutionRecord>> {
        let rule_id = rule_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM rule_executions WHERE rule_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![rule_id, limit], RecordRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(RecordRow::into_record).collect()
            })
            .await
    }

    /// Most recent records across all rules, newest first.
    #[instrument(skip(self))]
    pub async fn recent(&self, limit: i64) -> StoreResult<Vec<ExecutionRecord>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM rule_executions \
                     ORDER BY created_at DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], RecordRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(RecordRow::into_record).collect()
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn count_for_rule(&self, rule_id: &str) -> StoreResult<i64> {
        let rule_id = rule_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM rule_executions WHERE rule_id = ?1",
                    rusqlite::params![rule_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct RecordRow {
    id: String,
    rule_id: String,
    trigger_type: String,
    trigger_data: String,
    actions: String,
    results: String,
    status: String,
    error_message: Option<String>,
    execution_time_ms: i64,
    user_id: Option<String>,
    conversation_id: Option<String>,
    message_id: Option<String>,
    created_at: i64,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            trigger_type: row.get(2)?,
            trigger_data: row.get(3)?,
            actions: row.get(4)?,
            results: row.get(5)?,
            status: row.get(6)?,
            error_message: row.get(7)?,
            execution_time_ms: row.get(8)?,
            user_id: row.get(9)?,
            conversation_id: row.get(10)?,
            message_id: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_record(self) -> StoreResult<ExecutionRecord> {
        Ok(ExecutionRecord {
            trigger_data: serde_json::from_str(&self.trigger_data)?,
            actions: serde_json::from_str(&self.actions)?,
            results: serde_json::from_str(&self.results)?,
            status: ExecutionStatus::parse(&self.status)?,
            id: self.id,
            rule_id: self.rule_id,
            trigger_type: self.trigger_type,
            error_message: self.error_message,
            execution_time_ms: self.execution_time_ms,
            user_id: self.user_id,
            conversation_id: self.conversation_id,
            message_id: self.message_id,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
