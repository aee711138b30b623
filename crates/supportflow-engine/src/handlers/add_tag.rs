//! `add_tag`: merge tags into a user's or a conversation's tag set.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_store::{ActionSpec, DirectoryStore};
use tracing::debug;

use super::{parse_config, pick_id, resolve_id, rfc3339};
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::registry::{ActionHandler, BuiltinAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TagTarget {
    User,
    Conversation,
}

#[derive(Debug, Deserialize)]
struct AddTagConfig {
    #[serde(default)]
    tags: Vec<String>,
    /// Single-tag shorthand.
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    target: Option<TagTarget>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

pub struct AddTagHandler {
    directory: DirectoryStore,
}

impl AddTagHandler {
    pub fn new(directory: DirectoryStore) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ActionHandler for AddTagHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::AddTag.as_str()
    }

    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext) -> Result<Value, ActionError> {
        let config: AddTagConfig = parse_config(action)?;
        let tags: Vec<String> = config
            .tags
            .into_iter()
            .chain(config.tag)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            return Err(ActionError::InvalidConfig("no tags to add".into()));
        }

        let conversation_id = pick_id(
            config.conversation_id.as_deref(),
            ctx.conversation_id.as_deref(),
        );
        let target = config.target.unwrap_or(if conversation_id.is_some() {
            TagTarget::Conversation
        } else {
            TagTarget::User
        });

        let stamp = json!({
            "tagged_by": "automation",
            "rule_action": self.action_type(),
            "tags": tags,
            "tagged_at": rfc3339(ctx.timestamp),
        });

        let (target_name, id, merged) = match target {
            TagTarget::User => {
                let id = resolve_id(config.user_id.as_deref(), ctx.user_id.as_deref(), "user")?;
                let merged = self
                    .directory
                    .add_user_tags(&id, tags, "last_tagged", stamp)
                    .await?;
                ("user", id, merged)
            }
            TagTarget::Conversation => {
                let id = resolve_id(conversation_id, None, "conversation")?;
                let merged = self
                    .directory
                    .add_conversation_tags(&id, tags, "last_tagged", stamp)
                    .await?;
                ("conversation", id, merged)
            }
        };
        debug!(target = target_name, %id, "tags added");

        Ok(json!({ "target": target_name, "id": id, "tags": merged }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{directory, user_with_conversation};

    #[tokio::test]
    async fn defaults_to_conversation_when_context_has_one() {
        let directory = directory().await;
        let (user, conversation) = user_with_conversation(&directory, "telegram").await;
        let handler = AddTagHandler::new(directory.clone());
        let ctx = TriggerContext::manual(json!({}))
            .with_user(&user.id)
            .with_conversation(&conversation.id);

        let result = handler
            .execute(&ActionSpec::new("add_tag", json!({"tags": ["refund", "refund", " urgent "]})), &ctx)
            .await
            .unwrap();
        assert_eq!(result["target"], "conversation");
        assert_eq!(result["tags"], json!(["refund", "urgent"]));

        let stored = directory.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.tags, vec!["refund", "urgent"]);
        assert_eq!(stored.metadata["last_tagged"]["tagged_by"], "automation");
    }

    #[tokio::test]
    async fn explicit_user_target_merges_existing_tags() {
        let directory = directory().await;
        let (user, conversation) = user_with_conversation(&directory, "telegram").await;
        let handler = AddTagHandler::new(directory.clone());
        let ctx = TriggerContext::manual(json!({}))
            .with_user(&user.id)
            .with_conversation(&conversation.id);

        for tag in ["vip", "returning", "vip"] {
            handler
                .execute(&ActionSpec::new("add_tag", json!({"tag": tag, "target": "user"})), &ctx)
                .await
                .unwrap();
        }
        let stored = directory.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.tags, vec!["vip", "returning"]);
    }

    #[tokio::test]
    async fn falls_back_to_user_without_conversation() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "telegram").await;
        let handler = AddTagHandler::new(directory.clone());
        let ctx = TriggerContext::manual(json!({})).with_user(&user.id);

        let result = handler
            .execute(&ActionSpec::new("add_tag", json!({"tags": ["lead"]})), &ctx)
            .await
            .unwrap();
        assert_eq!(result["target"], "user");
    }

    #[tokio::test]
    async fn empty_tag_list_is_config_error() {
        let handler = AddTagHandler::new(directory().await);
        let ctx = TriggerContext::manual(json!({})).with_user("u1");
        let err = handler
            .execute(&ActionSpec::new("add_tag", json!({"tags": ["  "]})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfig(_)));
    }
}
