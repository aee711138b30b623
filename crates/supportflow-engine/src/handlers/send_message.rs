//! `send_message`: deliver literal or templated text to a user.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_store::{ActionSpec, DirectoryStore};

use super::delivery::Delivery;
use super::{parse_config, pick_id, resolve_id, template};
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::ports::MessageChannel;
use crate::registry::{ActionHandler, BuiltinAction};

#[derive(Debug, Deserialize)]
struct SendMessageConfig {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

pub struct SendMessageHandler {
    delivery: Delivery,
}

impl SendMessageHandler {
    pub fn new(directory: DirectoryStore, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            delivery: Delivery::new(directory, channel),
        }
    }
}

#[async_trait]
impl ActionHandler for SendMessageHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::SendMessage.as_str()
    }

    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext) -> Result<Value, ActionError> {
        let config: SendMessageConfig = parse_config(action)?;
        let raw = config
            .text
            .or(config.template)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ActionError::InvalidConfig("`text` or `template` is required".into()))?;

        let user_id = resolve_id(config.user_id.as_deref(), ctx.user_id.as_deref(), "user")?;
        let user = self.delivery.load_user(&user_id).await?;

        let text = template::render(&raw, &template::variables(ctx, Some(&user)));
        let conversation_id = pick_id(
            config.conversation_id.as_deref(),
            ctx.conversation_id.as_deref(),
        );

        let delivered = self
            .delivery
            .send(
                &user,
                conversation_id,
                &text,
                json!({ "rule_action": self.action_type() }),
                ctx,
            )
            .await?;

        Ok(json!({
            "delivered": true,
            "user_id": user.id,
            "platform": delivered.receipt.platform,
            "platform_message_id": delivered.receipt.message_id,
            "stored_message_id": delivered.stored_message_id,
            "text": text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{RecordingChannel, directory, user_with_conversation};

    #[tokio::test]
    async fn renders_template_and_records_bot_message() {
        let directory = directory().await;
        let (user, conversation) = user_with_conversation(&directory, "telegram").await;
        let channel = Arc::new(RecordingChannel::new("telegram"));
        let handler = SendMessageHandler::new(directory.clone(), channel.clone());

        let ctx = TriggerContext::message_received(&user.id, &conversation.id, "m1", "where is my order");
        let action = ActionSpec::new(
            "send_message",
            json!({"template": "Hi {{user_name}}, about \"{{message_content}}\" {{unknown}}"}),
        );
        let result = handler.execute(&action, &ctx).await.unwrap();

        let expected = "Hi Ada, about \"where is my order\" {{unknown}}";
        assert_eq!(result["text"], expected);
        assert_eq!(channel.sent(), vec![("chat-42".to_string(), expected.to_string())]);

        let history = directory.list_messages(&conversation.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, expected);
        assert_eq!(history[0].metadata["automation"], true);
        assert_eq!(history[0].metadata["rule_action"], "send_message");
    }

    #[tokio::test]
    async fn missing_text_is_config_error() {
        let directory = directory().await;
        let handler =
            SendMessageHandler::new(directory, Arc::new(RecordingChannel::new("telegram")));
        let ctx = TriggerContext::manual(json!({})).with_user("u1");
        let err = handler
            .execute(&ActionSpec::new("send_message", json!({})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn empty_user_override_targets_context_user() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "telegram").await;
        let channel = Arc::new(RecordingChannel::new("telegram"));
        let handler = SendMessageHandler::new(directory, channel.clone());
        let ctx = TriggerContext::manual(json!({})).with_user(&user.id);
        handler
            .execute(
                &ActionSpec::new("send_message", json!({"text": "hi", "user_id": ""})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(channel.sent(), vec![("chat-42".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let directory = directory().await;
        let handler =
            SendMessageHandler::new(directory, Arc::new(RecordingChannel::new("telegram")));
        let ctx = TriggerContext::manual(json!({})).with_user("ghost");
        let err = handler
            .execute(&ActionSpec::new("send_message", json!({"text": "hi"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn unsupported_platform_is_reported() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "whatsapp").await;
        let handler =
            SendMessageHandler::new(directory, Arc::new(RecordingChannel::new("telegram")));
        let ctx = TriggerContext::manual(json!({})).with_user(&user.id);
        let err = handler
            .execute(&ActionSpec::new("send_message", json!({"text": "hi"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnsupportedChannel { platform } if platform == "whatsapp"));
    }

    #[tokio::test]
    async fn channel_failure_is_delivery_error() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "telegram").await;
        let handler = SendMessageHandler::new(
            directory,
            Arc::new(RecordingChannel::failing("telegram", "bot blocked")),
        );
        let ctx = TriggerContext::manual(json!({})).with_user(&user.id);
        let err = handler
            .execute(&ActionSpec::new("send_message", json!({"text": "hi"})), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "delivery failed: bot blocked");
    }
}
