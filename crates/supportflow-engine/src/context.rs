//! The event envelope flowing through the pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Context type emitted by the scheduler.
pub const SCHEDULED_EXECUTION: &str = "scheduled_execution";
/// Context type that `escalation` rules react to.
pub const ESCALATION_NEEDED: &str = "escalation_needed";

/// An incoming event plus correlation handles.
///
/// `timestamp` (Unix seconds) is the instant the engine treats as "now"
/// when evaluating cooldowns, inactivity and time windows for this event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub timestamp: i64,
}

impl TriggerContext {
    /// A bare context stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            user_id: None,
            conversation_id: None,
            message_id: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// An inbound user message.
    pub fn message_received(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new("message_received", json!({ "text": text.into() }))
            .with_user(user_id)
            .with_conversation(conversation_id)
            .with_message(message_id)
    }

    pub fn user_status_changed(
        user_id: impl Into<String>,
        old_status: &str,
        new_status: &str,
    ) -> Self {
        Self::new(
            "user_status_changed",
            json!({ "old_status": old_status, "new_status": new_status }),
        )
        .with_user(user_id)
    }

    /// Periodic inactivity sweep for one conversation.
    pub fn conversation_inactive(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self::new("conversation_inactive", json!({}))
            .with_user(user_id)
            .with_conversation(conversation_id)
    }

    pub fn escalation_needed(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        reason: &str,
    ) -> Self {
        Self::new(ESCALATION_NEEDED, json!({ "reason": reason }))
            .with_user(user_id)
            .with_conversation(conversation_id)
    }

    /// A named application event with an arbitrary payload.
    pub fn custom_event(event_name: impl Into<String>, payload: Value) -> Self {
        Self::new(event_name, json!({ "payload": payload }))
    }

    /// Synthesized by the scheduler when a schedule's cron time arrives.
    pub fn scheduled_execution(rule_id: &str, schedule_id: &str, fired_at: i64) -> Self {
        let mut ctx = Self::new(
            SCHEDULED_EXECUTION,
            json!({ "rule_id": rule_id, "schedule_id": schedule_id }),
        );
        ctx.timestamp = fired_at;
        ctx
    }

    /// Operator-initiated firing from the CLI or an admin surface.
    pub fn manual(data: Value) -> Self {
        Self::new("manual", data)
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The message text, looked up under `text`, `message` then `content`.
    pub fn message_text(&self) -> Option<&str> {
        ["text", "message", "content"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_str))
    }

    /// Custom template variables from `data.variables`.
    pub fn variables(&self) -> Option<&serde_json::Map<String, Value>> {
        self.data.get("variables").and_then(Value::as_object)
    }
}
