//! Shared outbound path for `send_message` and `ai_response`.

use std::sync::Arc;

use serde_json::{Value, json};
use supportflow_store::{DirectoryStore, MessageSender, SupportUser};
use tracing::{debug, warn};

use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::ports::{ChannelError, DeliveryReceipt, MessageChannel};

/// What was delivered and where it was recorded.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub receipt: DeliveryReceipt,
    /// Id of the bot message appended to the conversation, if any.
    pub stored_message_id: Option<String>,
}

/// Delivers text to users over a [`MessageChannel`] and mirrors it into
/// the conversation history.
#[derive(Clone)]
pub struct Delivery {
    directory: DirectoryStore,
    channel: Arc<dyn MessageChannel>,
}

impl Delivery {
    pub fn new(directory: DirectoryStore, channel: Arc<dyn MessageChannel>) -> Self {
        Self { directory, channel }
    }

    pub fn directory(&self) -> &DirectoryStore {
        &self.directory
    }

    pub async fn load_user(&self, user_id: &str) -> Result<SupportUser, ActionError> {
        self.directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| ActionError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            })
    }

    /// Send `text` to `user`, then append it as a bot message to
    /// `conversation_id` with `metadata` merged into the provenance.
    ///
    /// A failed history write is logged and does not fail the delivery.
    pub async fn send(
        &self,
        user: &SupportUser,
        conversation_id: Option<&str>,
        text: &str,
        metadata: Value,
        ctx: &TriggerContext,
    ) -> Result<Delivered, ActionError> {
        if !self.channel.supports(&user.platform) {
            return Err(ActionError::UnsupportedChannel {
                platform: user.platform.clone(),
            });
        }

        let receipt = self
            .channel
            .deliver(&user.platform, &user.platform_address, text)
            .await
            .map_err(|e| match e {
                ChannelError::Unsupported(platform) => ActionError::UnsupportedChannel { platform },
                ChannelError::Failed(reason) => ActionError::Delivery(reason),
            })?;
        debug!(user_id = %user.id, platform = %user.platform, "message delivered");

        let Some(conversation_id) = conversation_id else {
            return Ok(Delivered {
                receipt,
                stored_message_id: None,
            });
        };

        let mut stamp = json!({
            "automation": true,
            "platform": receipt.platform,
            "platform_message_id": receipt.message_id,
        });
        if let (Some(fields), Value::Object(extra)) = (stamp.as_object_mut(), metadata) {
            fields.extend(extra);
        }

        let stored_message_id = match self
            .directory
            .append_message(conversation_id, MessageSender::Bot, text, stamp, ctx.timestamp)
            .await
        {
            Ok(message) => Some(message.id),
            Err(e) => {
                warn!(%conversation_id, error = %e, "delivered message not recorded in history");
                None
            }
        };

        Ok(Delivered {
            receipt,
            stored_message_id,
        })
    }
}
