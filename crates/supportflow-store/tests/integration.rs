//! Integration tests for the supportflow-store crate.
//!
//! These run against a real SQLite file on disk (via tempfile) to cover
//! reopening, cascades and the audit trail surviving rule deletion.

use serde_json::json;
use supportflow_store::{
    ActionSpec, Database, DirectoryStore, ExecutionLogStore, ExecutionStatus, MessageSender,
    NewExecutionRecord, NewRule, NewUser, RuleStatus, RuleStore, ScheduleStore, TriggerKind,
};

fn keyword_rule(name: &str) -> NewRule {
    NewRule {
        status: RuleStatus::Active,
        trigger_config: json!({"keywords": ["refund"]}),
        actions: vec![ActionSpec::new("add_tag", json!({"tags": ["refund"]}))],
        ..NewRule::new(name, TriggerKind::Keyword)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn database_open_and_migrate_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("supportflow.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();
    let rules = RuleStore::new(db);
    assert_eq!(rules.count().await.unwrap(), 0);
    assert!(db_path.exists());
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("reopen.db");

    let rule_id = {
        let db = Database::open_and_migrate(db_path.clone()).await.unwrap();
        let rules = RuleStore::new(db);
        let rule = rules.create(keyword_rule("refunds")).await.unwrap();
        assert!(rules.try_claim(&rule.id, 1_000).await.unwrap());
        rule.id
    };

    let db = Database::open_and_migrate(db_path).await.unwrap();
    let rules = RuleStore::new(db);
    let rule = rules.get(&rule_id).await.unwrap().unwrap();
    assert_eq!(rule.execution_count, 1);
    assert_eq!(rule.last_executed_at, Some(1_000));
}

// ═══════════════════════════════════════════════════════════════════════
//  Cross-store behaviour
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn deleting_rule_keeps_audit_and_drops_schedules() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("audit.db"))
        .await
        .unwrap();
    let rules = RuleStore::new(db.clone());
    let schedules = ScheduleStore::new(db.clone());
    let log = ExecutionLogStore::new(db);

    let rule = rules.create(keyword_rule("doomed")).await.unwrap();
    schedules.create(&rule.id, "* * * * *", "UTC").await.unwrap();
    log.append(NewExecutionRecord {
        rule_id: rule.id.clone(),
        trigger_type: "manual".into(),
        trigger_data: json!({}),
        actions: rule.actions.clone(),
        results: json!([]),
        status: ExecutionStatus::Success,
        error_message: None,
        execution_time_ms: 1,
        user_id: None,
        conversation_id: None,
        message_id: None,
    })
    .await
    .unwrap();

    rules.delete(&rule.id).await.unwrap();

    assert!(schedules.list_for_rule(&rule.id).await.unwrap().is_empty());
    assert_eq!(log.count_for_rule(&rule.id).await.unwrap(), 1);
}

#[tokio::test]
async fn pausing_rule_disarms_its_schedules() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let rules = RuleStore::new(db.clone());
    let schedules = ScheduleStore::new(db);

    let rule = rules.create(keyword_rule("hourly")).await.unwrap();
    schedules.create(&rule.id, "0 * * * *", "UTC").await.unwrap();
    assert_eq!(schedules.list_armable().await.unwrap().len(), 1);

    rules.set_status(&rule.id, RuleStatus::Paused).await.unwrap();
    assert!(schedules.list_armable().await.unwrap().is_empty());
}

#[tokio::test]
async fn conversation_flow_through_directory() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let dir = DirectoryStore::new(db);

    let user = dir
        .create_user(NewUser {
            display_name: Some("Grace".into()),
            platform: "webchat".into(),
            platform_address: "session-1".into(),
            status: "active".into(),
            tags: vec![],
        })
        .await
        .unwrap();
    let conversation = dir.open_conversation(&user.id).await.unwrap();
    let operator = dir.create_operator("ops", Some("senior"), true).await.unwrap();

    dir.append_message(&conversation.id, MessageSender::User, "hi", json!({}), 50)
        .await
        .unwrap();
    dir.append_message(
        &conversation.id,
        MessageSender::Bot,
        "hello!",
        json!({"automation": true}),
        60,
    )
    .await
    .unwrap();
    dir.assign_operator(&conversation.id, &operator.id, 70)
        .await
        .unwrap();

    let fetched = dir.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(fetched.assigned_operator_id.as_deref(), Some(operator.id.as_str()));
    assert_eq!(fetched.assigned_at, Some(70));
    assert_eq!(dir.message_count(&conversation.id).await.unwrap(), 2);

    let messages = dir.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages[1].sender, MessageSender::Bot);
    assert_eq!(messages[1].metadata["automation"], json!(true));
}
