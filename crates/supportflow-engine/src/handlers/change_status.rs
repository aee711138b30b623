//! `change_user_status`: move a user to another lifecycle status.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_store::{ActionSpec, DirectoryStore};
use tracing::info;

use super::{parse_config, resolve_id, rfc3339};
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::registry::{ActionHandler, BuiltinAction};

/// The closed set of user statuses automation may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    New,
    Active,
    Vip,
    Inactive,
    Blocked,
    Churned,
}

impl UserStatus {
    pub const ALL: [UserStatus; 6] = [
        Self::New,
        Self::Active,
        Self::Vip,
        Self::Inactive,
        Self::Blocked,
        Self::Churned,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Vip => "vip",
            Self::Inactive => "inactive",
            Self::Blocked => "blocked",
            Self::Churned => "churned",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeStatusConfig {
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

pub struct ChangeStatusHandler {
    directory: DirectoryStore,
}

impl ChangeStatusHandler {
    pub fn new(directory: DirectoryStore) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ActionHandler for ChangeStatusHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::ChangeUserStatus.as_str()
    }

    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext) -> Result<Value, ActionError> {
        let config: ChangeStatusConfig = parse_config(action)?;
        let status = UserStatus::parse(&config.status).ok_or_else(|| {
            ActionError::InvalidConfig(format!("unknown user status `{}`", config.status))
        })?;
        let user_id = resolve_id(config.user_id.as_deref(), ctx.user_id.as_deref(), "user")?;

        let stamp = json!({
            "changed_by": "automation",
            "rule_action": self.action_type(),
            "changed_at": rfc3339(ctx.timestamp),
            "reason": config.reason,
        });
        let previous = self
            .directory
            .update_user_status(&user_id, status.as_str(), "status_change", stamp)
            .await?;
        info!(%user_id, from = %previous, to = status.as_str(), "user status changed");

        Ok(json!({
            "user_id": user_id,
            "previous_status": previous,
            "status": status.as_str(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{directory, user_with_conversation};

    #[tokio::test]
    async fn changes_status_and_stamps_provenance() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "telegram").await;
        let handler = ChangeStatusHandler::new(directory.clone());

        let ctx = TriggerContext::manual(json!({})).with_user(&user.id).at(0);
        let result = handler
            .execute(
                &ActionSpec::new("change_user_status", json!({"status": "VIP", "reason": "big order"})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result["previous_status"], "new");
        assert_eq!(result["status"], "vip");

        let stored = directory.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "vip");
        let stamp = &stored.metadata["status_change"];
        assert_eq!(stamp["changed_by"], "automation");
        assert_eq!(stamp["rule_action"], "change_user_status");
        assert_eq!(stamp["reason"], "big order");
        assert_eq!(stamp["previous_status"], "new");
        assert_eq!(stamp["changed_at"], "1970-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn rejects_status_outside_closed_set() {
        let directory = directory().await;
        let (user, _) = user_with_conversation(&directory, "telegram").await;
        let handler = ChangeStatusHandler::new(directory.clone());
        let ctx = TriggerContext::manual(json!({})).with_user(&user.id);

        let err = handler
            .execute(&ActionSpec::new("change_user_status", json!({"status": "royalty"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfig(_)));

        let stored = directory.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "new");
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let handler = ChangeStatusHandler::new(directory().await);
        let ctx = TriggerContext::manual(json!({})).with_user("ghost");
        let err = handler
            .execute(&ActionSpec::new("change_user_status", json!({"status": "active"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::NotFound { entity: "user", .. }));
    }
}
