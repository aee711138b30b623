//! Built-in action handlers.
//!
//! Every handler parses its own slice of `action.config` into a typed
//! struct, resolves targets through the [`DirectoryStore`] and reports
//! failures as [`ActionError`]s. None of them panic on bad input.

pub mod add_tag;
pub mod ai_response;
pub mod assign_operator;
pub mod change_status;
pub mod delay;
pub mod delivery;
pub mod send_message;
pub mod template;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use supportflow_store::{ActionSpec, DirectoryStore};

use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::ports::{AiResponder, MessageChannel};
use crate::registry::HandlerRegistry;

pub use add_tag::AddTagHandler;
pub use ai_response::AiResponseHandler;
pub use assign_operator::{AssignOperatorHandler, AssignmentStrategy};
pub use change_status::{ChangeStatusHandler, UserStatus};
pub use delay::DelayHandler;
pub use send_message::SendMessageHandler;

/// Collaborators shared by the built-in handlers.
#[derive(Clone)]
pub struct HandlerDeps {
    pub directory: DirectoryStore,
    pub config: EngineConfig,
    pub channel: Option<Arc<dyn MessageChannel>>,
    pub ai: Option<Arc<dyn AiResponder>>,
}

/// Register every built-in handler whose collaborators are available.
///
/// `send_message` needs a channel and `ai_response` needs a channel plus
/// an AI responder; without them those tags stay unregistered and actions
/// using them fail with "no handler".
pub fn register_builtins(registry: &HandlerRegistry, deps: &HandlerDeps) {
    let directory = deps.directory.clone();

    if let Some(channel) = &deps.channel {
        registry.register(Arc::new(SendMessageHandler::new(
            directory.clone(),
            Arc::clone(channel),
        )));
        match &deps.ai {
            Some(ai) => registry.register(Arc::new(AiResponseHandler::new(
                directory.clone(),
                Arc::clone(channel),
                Arc::clone(ai),
                deps.config.ai_timeout(),
            ))),
            None => tracing::info!("no ai responder configured, ai_response disabled"),
        }
    } else {
        tracing::info!("no message channel configured, send_message and ai_response disabled");
    }

    registry.register(Arc::new(AssignOperatorHandler::new(
        directory.clone(),
        deps.config.assignment_window_minutes,
    )));
    registry.register(Arc::new(ChangeStatusHandler::new(directory.clone())));
    registry.register(Arc::new(AddTagHandler::new(directory)));
    registry.register(Arc::new(DelayHandler::new(deps.config.max_action_delay())));
}

/// Deserialize `action.config`, treating `null` as an empty object.
pub(crate) fn parse_config<T: DeserializeOwned>(action: &ActionSpec) -> Result<T, ActionError> {
    let raw = match &action.config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(raw).map_err(|e| ActionError::InvalidConfig(e.to_string()))
}

/// RFC 3339 rendering of a Unix timestamp, used in provenance stamps.
pub(crate) fn rfc3339(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

/// The config override if it is non-blank, else the context's id.
pub(crate) fn pick_id<'a>(
    overridden: Option<&'a str>,
    from_context: Option<&'a str>,
) -> Option<&'a str> {
    let present = |id: &&str| !id.trim().is_empty();
    overridden.filter(present).or(from_context.filter(present))
}

/// Like [`pick_id`], but a missing id is a configuration error.
pub(crate) fn resolve_id(
    overridden: Option<&str>,
    from_context: Option<&str>,
    what: &str,
) -> Result<String, ActionError> {
    pick_id(overridden, from_context)
        .map(str::to_string)
        .ok_or_else(|| ActionError::InvalidConfig(format!("no target {what} in config or context")))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler tests.

    use std::sync::Mutex;

    use async_trait::async_trait;
    use supportflow_store::{Conversation, Database, NewUser, SupportUser};

    use super::*;
    use crate::ports::{ChannelError, DeliveryReceipt};

    /// A channel that records deliveries and serves one platform.
    pub struct RecordingChannel {
        pub platform: &'static str,
        pub fail_with: Option<String>,
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChannel {
        pub fn new(platform: &'static str) -> Self {
            Self {
                platform,
                fail_with: None,
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(platform: &'static str, reason: &str) -> Self {
            Self {
                fail_with: Some(reason.to_string()),
                ..Self::new(platform)
            }
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        fn supports(&self, platform: &str) -> bool {
            platform == self.platform
        }

        async fn deliver(
            &self,
            platform: &str,
            address: &str,
            text: &str,
        ) -> Result<DeliveryReceipt, ChannelError> {
            if let Some(reason) = &self.fail_with {
                return Err(ChannelError::Failed(reason.clone()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((address.to_string(), text.to_string()));
            Ok(DeliveryReceipt {
                platform: platform.to_string(),
                message_id: Some(format!("m{}", sent.len())),
            })
        }
    }

    pub async fn directory() -> DirectoryStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        DirectoryStore::new(db)
    }

    pub async fn user_with_conversation(
        directory: &DirectoryStore,
        platform: &str,
    ) -> (SupportUser, Conversation) {
        let user = directory
            .create_user(NewUser {
                display_name: Some("Ada".into()),
                platform: platform.into(),
                platform_address: "chat-42".into(),
                status: "new".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let conversation = directory.open_conversation(&user.id).await.unwrap();
        (user, conversation)
    }
}
