//! Cron schedules bound to rules.
//!
//! A schedule has no effect on its own: the scheduler only arms schedules
//! that are themselves active *and* whose owning rule is active, which is
//! what [`ScheduleStore::list_armable`] returns.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted cron binding for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub rule_id: String,
    /// 5, 6 or 7 field cron expression.
    pub cron_expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    pub is_active: bool,
    pub last_run_at: Option<i64>,
    pub run_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  ScheduleStore
// ═══════════════════════════════════════════════════════════════════════

const SCHEDULE_COLUMNS: &str = "s.id, s.rule_id, s.cron_expression, s.timezone, s.is_active, \
     s.last_run_at, s.run_count, s.created_at, s.updated_at";

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Attach a new active schedule to `rule_id`.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        rule_id: &str,
        cron_expression: &str,
        timezone: &str,
    ) -> StoreResult<Schedule> {
        if cron_expression.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "cron expression is empty".into(),
            ));
        }

        let now = Utc::now().timestamp();
        let schedule = Schedule {
            id: Uuid::now_v7().to_string(),
            rule_id: rule_id.to_string(),
            cron_expression: cron_expression.trim().to_string(),
            timezone: timezone.to_string(),
            is_active: true,
            last_run_at: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };

        let row = schedule.clone();
        self.db
            .execute(move |conn| {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM rules WHERE id = ?1",
                    rusqlite::params![row.rule_id],
                    |r| r.get(0),
                )?;
                if exists == 0 {
                    return Err(StoreError::NotFound {
                        entity: "rule",
                        id: row.rule_id,
                    });
                }
                conn.execute(
                    "INSERT INTO rule_schedules (id, rule_id, cron_expression, timezone, is_active, \
                     last_run_at, run_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 1, NULL, 0, ?5, ?5)",
                    rusqlite::params![
                        row.id,
                        row.rule_id,
                        row.cron_expression,
                        row.timezone,
                        row.created_at
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!(schedule_id = %schedule.id, rule_id = %schedule.rule_id, "schedule created");
        Ok(schedule)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<Schedule>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {SCHEDULE_COLUMNS} FROM rule_schedules s WHERE s.id = ?1"),
                    rusqlite::params![id],
                    schedule_from_row,
                );
                match result {
                    Ok(schedule) => Ok(Some(schedule)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Every schedule, regardless of state.
    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<Schedule>> {
        self.query(
            format!("SELECT {SCHEDULE_COLUMNS} FROM rule_schedules s ORDER BY s.created_at, s.id"),
            None,
        )
        .await
    }

    /// Every schedule of one rule, regardless of state.
    #[instrument(skip(self))]
    pub async fn list_for_rule(&self, rule_id: &str) -> StoreResult<Vec<Schedule>> {
        self.query(
            format!(
                "SELECT {SCHEDULE_COLUMNS} FROM rule_schedules s WHERE s.rule_id = ?1 \
                 ORDER BY s.created_at, s.id"
            ),
            Some(rule_id.to_string()),
        )
        .await
    }

    /// Active schedules whose rule is also active.
    #[instrument(skip(self))]
    pub async fn list_armable(&self) -> StoreResult<Vec<Schedule>> {
        self.query(
            format!(
                "SELECT {SCHEDULE_COLUMNS} FROM rule_schedules s \
                 JOIN rules r ON r.id = s.rule_id \
                 WHERE s.is_active = 1 AND r.status = 'active' \
                 ORDER BY s.created_at, s.id"
            ),
            None,
        )
        .await
    }

    /// [`list_armable`](Self::list_armable) restricted to one rule.
    #[instrument(skip(self))]
    pub async fn list_armable_for_rule(&self, rule_id: &str) -> StoreResult<Vec<Schedule>> {
        self.query(
            format!(
                "SELECT {SCHEDULE_COLUMNS} FROM rule_schedules s \
                 JOIN rules r ON r.id = s.rule_id \
                 WHERE s.rule_id = ?1 AND s.is_active = 1 AND r.status = 'active' \
                 ORDER BY s.created_at, s.id"
            ),
            Some(rule_id.to_string()),
        )
        .await
    }

    async fn query(&self, sql: String, rule_id: Option<String>) -> StoreResult<Vec<Schedule>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = match rule_id {
                    Some(rule_id) => stmt
                        .query_map(rusqlite::params![rule_id], schedule_from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map([], schedule_from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_active(&self, id: &str, active: bool) -> StoreResult<()> {
        let id = id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE rule_schedules SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, active, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Change the cron expression and timezone of a schedule.
    #[instrument(skip(self))]
    pub async fn update_expression(
        &self,
        id: &str,
        cron_expression: &str,
        timezone: &str,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let cron_expression = cron_expression.trim().to_string();
        let timezone = timezone.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE rule_schedules SET cron_expression = ?2, timezone = ?3, updated_at = ?4 \
                     WHERE id = ?1",
                    rusqlite::params![id, cron_expression, timezone, now],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Stamp a firing: `last_run_at = at`, `run_count += 1`.
    #[instrument(skip(self))]
    pub async fn record_run(&self, id: &str, at: i64) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE rule_schedules SET last_run_at = ?2, run_count = run_count + 1 \
                     WHERE id = ?1",
                    rusqlite::params![id, at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM rule_schedules WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        cron_expression: row.get(2)?,
        timezone: row.get(3)?,
        is_active: row.get(4)?,
        last_run_at: row.get(5)?,
        run_count: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_store::{ActionSpec, NewRule, RuleStatus, RuleStore, TriggerKind};
    use serde_json::json;

    async fn setup() -> (RuleStore, ScheduleStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        (RuleStore::new(db.clone()), ScheduleStore::new(db))
    }

    async fn scheduled_rule(rules: &RuleStore, status: RuleStatus) -> String {
        rules
            .create(NewRule {
                status,
                actions: vec![ActionSpec::new("delay", json!({"seconds": 0}))],
                ..NewRule::new("nightly", TriggerKind::ScheduledExecution)
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn create_requires_existing_rule() {
        let (_, schedules) = setup().await;
        let err = schedules
            .create("missing", "* * * * *", "UTC")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "rule", .. }));
    }

    #[tokio::test]
    async fn armable_requires_active_rule_and_schedule() {
        let (rules, schedules) = setup().await;
        let active = scheduled_rule(&rules, RuleStatus::Active).await;
        let draft = scheduled_rule(&rules, RuleStatus::Draft).await;

        let armed = schedules.create(&active, "* * * * *", "UTC").await.unwrap();
        let paused = schedules.create(&active, "0 9 * * *", "UTC").await.unwrap();
        schedules.create(&draft, "* * * * *", "UTC").await.unwrap();
        schedules.set_active(&paused.id, false).await.unwrap();

        let armable = schedules.list_armable().await.unwrap();
        assert_eq!(armable.len(), 1);
        assert_eq!(armable[0].id, armed.id);

        assert_eq!(schedules.list_for_rule(&active).await.unwrap().len(), 2);
        assert_eq!(
            schedules.list_armable_for_rule(&draft).await.unwrap().len(),
            0
        );
        assert_eq!(schedules.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn record_run_bumps_bookkeeping() {
        let (rules, schedules) = setup().await;
        let rule_id = scheduled_rule(&rules, RuleStatus::Active).await;
        let schedule = schedules
            .create(&rule_id, "*/5 * * * *", "Europe/Berlin")
            .await
            .unwrap();

        schedules.record_run(&schedule.id, 100).await.unwrap();
        schedules.record_run(&schedule.id, 400).await.unwrap();

        let fetched = schedules.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(fetched.run_count, 2);
        assert_eq!(fetched.last_run_at, Some(400));
        assert_eq!(fetched.timezone, "Europe/Berlin");
    }

    #[tokio::test]
    async fn update_expression_and_delete() {
        let (rules, schedules) = setup().await;
        let rule_id = scheduled_rule(&rules, RuleStatus::Active).await;
        let schedule = schedules.create(&rule_id, "* * * * *", "UTC").await.unwrap();

        schedules
            .update_expression(&schedule.id, "0 0 * * *", "Asia/Tokyo")
            .await
            .unwrap();
        let fetched = schedules.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(fetched.cron_expression, "0 0 * * *");
        assert_eq!(fetched.timezone, "Asia/Tokyo");

        schedules.delete(&schedule.id).await.unwrap();
        assert!(schedules.get(&schedule.id).await.unwrap().is_none());
        assert!(matches!(
            schedules.record_run(&schedule.id, 1).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }
}
