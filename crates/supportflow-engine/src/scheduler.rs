//! Cron scheduler for rules.
//!
//! [`RuleScheduler`] arms one tokio task per active schedule of an active
//! rule. When the schedule's next cron time arrives (evaluated in the
//! schedule's IANA timezone) the task builds a `scheduled_execution`
//! [`TriggerContext`] carrying the rule and schedule ids and hands it to
//! [`AutomationEngine::dispatch`]. A run is recorded on the schedule only
//! when the rule actually fired; an occurrence swallowed by cooldown, the
//! execution cap or a paused rule leaves `run_count` untouched. Cron expressions follow the `cron` crate's 6/7-field format;
//! standard 5-field input gets a `0` seconds field prepended.
//!
//! Re-arming after edits is driven by the caller through
//! [`schedule_rule`](RuleScheduler::schedule_rule) and
//! [`unschedule_rule`](RuleScheduler::unschedule_rule).

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use supportflow_store::{Schedule, ScheduleStore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conditions::parse_timezone;
use crate::context::TriggerContext;
use crate::engine::AutomationEngine;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalize a cron expression to the 6/7-field format expected by the
/// `cron` crate. A standard 5-field expression gets `0` seconds prepended.
pub fn normalize_cron_expr(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a cron expression string into a [`cron::Schedule`].
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let normalized = normalize_cron_expr(expr);
    cron::Schedule::from_str(&normalized).map_err(|e| EngineError::InvalidCronExpression {
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Next occurrence strictly after `after`, evaluated in `tz`.
pub fn next_run_after(
    schedule: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Wall clock anchored to tokio's monotonic clock, so timers follow
/// `tokio::time::pause` in tests.
#[derive(Debug, Clone, Copy)]
struct SchedulerClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl SchedulerClock {
    fn anchored_now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::zero())
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        let offset = (at - self.wall).to_std().unwrap_or_default();
        tokio::time::sleep_until(self.mono + offset).await;
    }
}

// ---------------------------------------------------------------------------
// RuleScheduler
// ---------------------------------------------------------------------------

struct ArmedSchedule {
    rule_id: String,
    handle: JoinHandle<()>,
}

/// Owns the background timers for every armed schedule.
#[derive(Clone)]
pub struct RuleScheduler {
    engine: AutomationEngine,
    schedules: ScheduleStore,
    armed: Arc<DashMap<String, ArmedSchedule>>,
    running: Arc<AtomicBool>,
}

impl RuleScheduler {
    pub fn new(engine: AutomationEngine, schedules: ScheduleStore) -> Self {
        Self {
            engine,
            schedules,
            armed: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arm every active schedule belonging to an active rule.
    ///
    /// Schedules with an invalid expression or timezone are logged and
    /// skipped. Returns the number of schedules armed.
    pub async fn start(&self) -> Result<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::SchedulerRunning);
        }

        let schedules = match self.schedules.list_armable().await {
            Ok(schedules) => schedules,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let armed = self.arm_each(&schedules);
        info!(armed, total = schedules.len(), "rule scheduler started");
        Ok(armed)
    }

    /// Cancel every armed timer.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("stop called but scheduler is not running");
        }
        let ids: Vec<String> = self.armed.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disarm(&id);
        }
        info!("rule scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// (Re-)arm all active schedules of `rule_id`.
    ///
    /// Existing timers for the rule are cancelled first, so this is the
    /// primitive to call after a rule is activated or a schedule edited.
    /// Schedules with an invalid expression or timezone are logged and
    /// skipped. Returns the number of schedules armed; `0` if the rule is
    /// not active.
    pub async fn schedule_rule(&self, rule_id: &str) -> Result<usize> {
        self.unschedule_rule(rule_id);
        let schedules = self.schedules.list_armable_for_rule(rule_id).await?;
        let armed = self.arm_each(&schedules);
        debug!(%rule_id, armed, total = schedules.len(), "rule scheduled");
        Ok(armed)
    }

    /// Cancel all timers of `rule_id`. Returns how many were cancelled.
    pub fn unschedule_rule(&self, rule_id: &str) -> usize {
        let ids: Vec<String> = self
            .armed
            .iter()
            .filter(|e| e.value().rule_id == rule_id)
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.disarm(id);
        }
        ids.len()
    }

    /// Arm a single schedule, replacing any timer already armed for it.
    pub fn arm_schedule(&self, schedule: &Schedule) -> Result<()> {
        let cron = parse_schedule(&schedule.cron_expression)?;
        let tz = parse_timezone(&schedule.timezone)?;

        let handle = tokio::spawn(run_schedule(
            self.engine.clone(),
            self.schedules.clone(),
            schedule.clone(),
            cron,
            tz,
        ));
        if let Some(previous) = self.armed.insert(
            schedule.id.clone(),
            ArmedSchedule {
                rule_id: schedule.rule_id.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
        }
        debug!(schedule_id = %schedule.id, cron = %schedule.cron_expression, tz = %tz, "schedule armed");
        Ok(())
    }

    /// Ids of the currently armed schedules, sorted.
    pub fn armed_schedule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.armed.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Arm every schedule that parses; a bad one only fails itself.
    fn arm_each(&self, schedules: &[Schedule]) -> usize {
        let mut armed = 0;
        for schedule in schedules {
            match self.arm_schedule(schedule) {
                Ok(()) => armed += 1,
                Err(e) => error!(
                    schedule_id = %schedule.id,
                    rule_id = %schedule.rule_id,
                    error = %e,
                    "schedule not armed"
                ),
            }
        }
        armed
    }

    fn disarm(&self, schedule_id: &str) {
        if let Some((_, armed)) = self.armed.remove(schedule_id) {
            armed.handle.abort();
            debug!(%schedule_id, "schedule disarmed");
        }
    }
}

/// Timer loop of one schedule. Runs until aborted or the expression has
/// no further occurrences.
async fn run_schedule(
    engine: AutomationEngine,
    schedules: ScheduleStore,
    schedule: Schedule,
    cron: cron::Schedule,
    tz: Tz,
) {
    let clock = SchedulerClock::anchored_now();
    let mut cursor = clock.now();

    loop {
        let Some(next) = next_run_after(&cron, tz, cursor) else {
            info!(schedule_id = %schedule.id, "schedule has no further occurrences");
            return;
        };
        clock.sleep_until(next).await;

        let fired_at = next.timestamp();
        let ctx = TriggerContext::scheduled_execution(&schedule.rule_id, &schedule.id, fired_at);
        let fired = match engine.dispatch(&ctx).await {
            Ok(firings) => firings.iter().any(|f| f.rule_id == schedule.rule_id),
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "scheduled trigger failed");
                false
            }
        };
        if fired {
            if let Err(e) = schedules.record_run(&schedule.id, fired_at).await {
                warn!(schedule_id = %schedule.id, error = %e, "schedule run not recorded");
            }
        } else {
            debug!(
                schedule_id = %schedule.id,
                rule_id = %schedule.rule_id,
                "scheduled rule skipped (cooldown, cap or inactive)"
            );
        }

        cursor = next;
        // Skip occurrences missed while the firing was running.
        let now = clock.now();
        if next_run_after(&cron, tz, cursor).is_some_and(|upcoming| upcoming < now) {
            warn!(schedule_id = %schedule.id, "scheduler fell behind, skipping missed occurrences");
            cursor = now;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_get_seconds() {
        assert_eq!(normalize_cron_expr("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron_expr("0 30 9 * * 1-5"), "0 30 9 * * 1-5");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = parse_schedule("not a cron").unwrap_err();
        assert!(matches!(err, EngineError::InvalidCronExpression { .. }));
    }

    #[test]
    fn next_run_respects_timezone() {
        let schedule = parse_schedule("0 9 * * *").unwrap();
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 2024-01-15 06:00 UTC is 07:00 in Berlin; 09:00 Berlin is 08:00 UTC.
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap();
        let next = next_run_after(&schedule, tz, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_paused_time() {
        let clock = SchedulerClock::anchored_now();
        let start = clock.now();
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!((clock.now() - start).num_seconds(), 90);

        let target = clock.now() + TimeDelta::seconds(30);
        clock.sleep_until(target).await;
        assert!(clock.now() >= target);
    }
}
