//! Subcommand implementations.
//!
//! Each `cmd_*` function prints its own output; the helpers below them are
//! the testable pieces.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_engine::scheduler::parse_schedule;
use supportflow_engine::{RuleFiring, TriggerContext, aggregate_status};
use supportflow_store::{NewRule, Rule, RuleStatus, Schedule};
use tracing::info;

use crate::wiring::Runtime;

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

pub async fn cmd_run(runtime: Runtime) -> Result<()> {
    let scheduler = runtime.scheduler();
    let armed = scheduler.start().await.context("failed to start scheduler")?;
    let active = runtime
        .engine
        .rules()
        .list_active()
        .await
        .context("failed to load rules")?
        .len();
    info!(
        active_rules = active,
        armed_schedules = armed,
        handlers = ?runtime.engine.registry().action_types(),
        "SupportFlow engine running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    scheduler.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: rules
// ---------------------------------------------------------------------------

pub async fn cmd_rules_list(runtime: &Runtime, all: bool) -> Result<()> {
    let rules = runtime.engine.rules();
    let mut list = if all {
        rules.list().await?
    } else {
        rules.list_active().await?
    };
    list.sort_by(|a, b| b.priority.cmp(&a.priority));

    if list.is_empty() {
        println!("No rules.");
        return Ok(());
    }
    print!("{}", format_rule_table(&list));
    Ok(())
}

pub async fn cmd_rules_import(runtime: &Runtime, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let entries = parse_rule_file(&content)
        .with_context(|| format!("invalid rule file {}", file.display()))?;

    for imported in import_rules(runtime, entries).await? {
        println!("{}  {}", imported.rule.id, imported.rule.name);
        for schedule in &imported.schedules {
            println!(
                "  schedule {}  {} ({})",
                schedule.id, schedule.cron_expression, schedule.timezone
            );
        }
    }
    Ok(())
}

pub async fn cmd_rules_set_status(runtime: &Runtime, rule_id: &str, status: &str) -> Result<()> {
    let status = RuleStatus::parse(status)?;
    runtime
        .engine
        .rules()
        .set_status(rule_id, status)
        .await
        .with_context(|| format!("failed to set status of rule {rule_id}"))?;
    println!("Rule {rule_id} is now {status}.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: fire / emit
// ---------------------------------------------------------------------------

pub async fn cmd_fire(
    runtime: &Runtime,
    rule_id: &str,
    user: Option<String>,
    conversation: Option<String>,
    data: Option<&str>,
) -> Result<()> {
    let ctx = with_handles(TriggerContext::manual(parse_data(data)?), user, conversation, None);
    let firing = runtime
        .engine
        .fire_rule(rule_id, &ctx)
        .await
        .with_context(|| format!("failed to fire rule {rule_id}"))?;
    println!("{}", serde_json::to_string_pretty(&firing_summary(&firing))?);
    Ok(())
}

pub async fn cmd_emit(
    runtime: &Runtime,
    event_type: &str,
    user: Option<String>,
    conversation: Option<String>,
    message: Option<String>,
    data: Option<&str>,
) -> Result<()> {
    let ctx = with_handles(
        TriggerContext::new(event_type, parse_data(data)?),
        user,
        conversation,
        message,
    );
    let firings = runtime
        .engine
        .dispatch(&ctx)
        .await
        .context("failed to process event")?;
    let summary: Vec<Value> = firings.iter().map(firing_summary).collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: history / schedules
// ---------------------------------------------------------------------------

pub async fn cmd_history(runtime: &Runtime, rule_id: &str, limit: i64) -> Result<()> {
    if runtime.engine.rules().get(rule_id).await?.is_none() {
        bail!("rule {rule_id} not found");
    }
    let records = runtime
        .executions
        .recent_for_rule(rule_id, limit.max(1))
        .await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

pub async fn cmd_schedules_list(runtime: &Runtime) -> Result<()> {
    let schedules = runtime.schedules.list().await?;
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }
    print!("{}", format_schedule_table(&schedules));
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One element of a rule import file.
#[derive(Debug, Deserialize)]
pub struct RuleImport {
    #[serde(flatten)]
    pub rule: NewRule,
    #[serde(default)]
    pub schedules: Vec<ScheduleImport>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleImport {
    #[serde(alias = "cron")]
    pub cron_expression: String,
    #[serde(default = "utc")]
    pub timezone: String,
}

fn utc() -> String {
    "UTC".to_string()
}

pub struct ImportedRule {
    pub rule: Rule,
    pub schedules: Vec<Schedule>,
}

/// Parse a rule file: a JSON array of rule definitions.
pub fn parse_rule_file(content: &str) -> Result<Vec<RuleImport>> {
    let entries: Vec<RuleImport> = serde_json::from_str(content)?;
    for entry in &entries {
        for schedule in &entry.schedules {
            parse_schedule(&schedule.cron_expression)
                .with_context(|| format!("rule '{}'", entry.rule.name))?;
        }
    }
    Ok(entries)
}

pub async fn import_rules(runtime: &Runtime, entries: Vec<RuleImport>) -> Result<Vec<ImportedRule>> {
    let mut imported = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.rule.name.clone();
        let rule = runtime
            .engine
            .rules()
            .create(entry.rule)
            .await
            .with_context(|| format!("failed to create rule '{name}'"))?;

        let mut schedules = Vec::with_capacity(entry.schedules.len());
        for schedule in entry.schedules {
            schedules.push(
                runtime
                    .schedules
                    .create(&rule.id, &schedule.cron_expression, &schedule.timezone)
                    .await
                    .with_context(|| format!("failed to schedule rule '{name}'"))?,
            );
        }
        info!(rule_id = %rule.id, rule = %rule.name, schedules = schedules.len(), "rule imported");
        imported.push(ImportedRule { rule, schedules });
    }
    Ok(imported)
}

/// `--data` must be a JSON object; absent means `{}`.
pub fn parse_data(data: Option<&str>) -> Result<Value> {
    let Some(raw) = data else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
    if !value.is_object() {
        bail!("--data must be a JSON object");
    }
    Ok(value)
}

fn with_handles(
    mut ctx: TriggerContext,
    user: Option<String>,
    conversation: Option<String>,
    message: Option<String>,
) -> TriggerContext {
    ctx.user_id = user;
    ctx.conversation_id = conversation;
    ctx.message_id = message;
    ctx
}

pub fn firing_summary(firing: &RuleFiring) -> Value {
    json!({
        "rule_id": firing.rule_id,
        "rule_name": firing.rule_name,
        "status": aggregate_status(&firing.results).as_str(),
        "record_id": firing.record.as_ref().map(|r| r.id.clone()),
        "results": firing.results,
    })
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_rule_table(rules: &[Rule]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<28}  {:<22}  {:<8}  {:>8}  {:>10}  {}",
        "ID", "NAME", "TRIGGER", "STATUS", "PRIORITY", "EXECUTIONS", "LAST RUN"
    );
    for rule in rules {
        let executions = match rule.max_executions {
            Some(max) => format!("{}/{}", rule.execution_count, max),
            None => rule.execution_count.to_string(),
        };
        let _ = writeln!(
            out,
            "{:<36}  {:<28}  {:<22}  {:<8}  {:>8}  {:>10}  {}",
            rule.id,
            truncate(&rule.name, 28),
            rule.trigger_type,
            rule.status,
            rule.priority,
            executions,
            format_ts(rule.last_executed_at)
        );
    }
    out
}

pub fn format_schedule_table(schedules: &[Schedule]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<36}  {:<18}  {:<16}  {:<6}  {:>5}  {}",
        "ID", "RULE", "CRON", "TIMEZONE", "ACTIVE", "RUNS", "LAST RUN"
    );
    for s in schedules {
        let _ = writeln!(
            out,
            "{:<36}  {:<36}  {:<18}  {:<16}  {:<6}  {:>5}  {}",
            s.id,
            s.rule_id,
            s.cron_expression,
            s.timezone,
            if s.is_active { "yes" } else { "no" },
            s.run_count,
            format_ts(s.last_run_at)
        );
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
