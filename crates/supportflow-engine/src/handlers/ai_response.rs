//! `ai_response`: generate an answer with the AI collaborator and deliver it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_store::{ActionSpec, DirectoryStore};
use tracing::debug;

use super::delivery::Delivery;
use super::{parse_config, resolve_id, template};
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::ports::{AiRequest, AiResponder, MessageChannel};
use crate::registry::{ActionHandler, BuiltinAction};

fn default_true() -> bool {
    true
}

fn default_max_documents() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct AiResponseConfig {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default = "default_true")]
    use_knowledge_base: bool,
    #[serde(default = "default_max_documents")]
    max_documents: u32,
    #[serde(default)]
    user_id: Option<String>,
}

pub struct AiResponseHandler {
    delivery: Delivery,
    ai: Arc<dyn AiResponder>,
    timeout: Duration,
}

impl AiResponseHandler {
    pub fn new(
        directory: DirectoryStore,
        channel: Arc<dyn MessageChannel>,
        ai: Arc<dyn AiResponder>,
        timeout: Duration,
    ) -> Self {
        Self {
            delivery: Delivery::new(directory, channel),
            ai,
            timeout,
        }
    }
}

#[async_trait]
impl ActionHandler for AiResponseHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::AiResponse.as_str()
    }

    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext) -> Result<Value, ActionError> {
        let config: AiResponseConfig = parse_config(action)?;
        let user_id = resolve_id(config.user_id.as_deref(), ctx.user_id.as_deref(), "user")?;
        let user = self.delivery.load_user(&user_id).await?;

        let prompt = match config.prompt.filter(|p| !p.trim().is_empty()) {
            Some(prompt) => template::render(&prompt, &template::variables(ctx, Some(&user))),
            None => ctx
                .message_text()
                .map(str::to_string)
                .ok_or_else(|| {
                    ActionError::InvalidConfig("no `prompt` configured and no message text".into())
                })?,
        };

        let answer = self
            .ai
            .generate(AiRequest {
                prompt,
                user_id: Some(user.id.clone()),
                conversation_id: ctx.conversation_id.clone(),
                use_knowledge_base: config.use_knowledge_base,
                max_documents: config.max_documents,
            })
            .await
            .map_err(|e| ActionError::Generation(e.0))?;
        debug!(model = %answer.model, completion_tokens = answer.completion_tokens, "ai answer generated");

        let delivered = self
            .delivery
            .send(
                &user,
                ctx.conversation_id.as_deref(),
                &answer.text,
                json!({
                    "rule_action": self.action_type(),
                    "ai_generated": true,
                    "model": answer.model,
                    "prompt_tokens": answer.prompt_tokens,
                    "completion_tokens": answer.completion_tokens,
                    "documents_used": answer.documents_used,
                }),
                ctx,
            )
            .await?;

        Ok(json!({
            "delivered": true,
            "user_id": user.id,
            "platform_message_id": delivered.receipt.message_id,
            "stored_message_id": delivered.stored_message_id,
            "model": answer.model,
            "documents_used": answer.documents_used,
            "text": answer.text,
        }))
    }

    fn timeout(&self, _action: &ActionSpec) -> Option<Duration> {
        Some(self.timeout)
    }
}
