//! Turns an [`AppConfig`] into a running engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use supportflow_adapters::{
    ChannelRouter, DryRunChannel, OpenAiResponder, TelegramChannel, WebhookChannel,
};
use supportflow_engine::{AiResponder, AutomationEngine, MessageChannel, RuleScheduler};
use supportflow_store::{Database, ExecutionLogStore, ScheduleStore};
use tracing::{info, warn};

use crate::config::{AppConfig, ChannelsConfig};

/// Everything a subcommand may need.
pub struct Runtime {
    pub engine: AutomationEngine,
    pub schedules: ScheduleStore,
    pub executions: ExecutionLogStore,
}

impl Runtime {
    pub fn scheduler(&self) -> RuleScheduler {
        RuleScheduler::new(self.engine.clone(), self.schedules.clone())
    }
}

/// Open (creating if needed) and migrate the database file.
pub async fn open_database(config: &AppConfig) -> Result<Database> {
    let path = config.database.path.clone();
    let path_str = path.display().to_string();
    let db = Database::open_and_migrate(path)
        .await
        .with_context(|| format!("failed to open database {path_str}"))?;
    info!(path = %path_str, "store initialized");
    Ok(db)
}

pub async fn build_runtime(config: &AppConfig) -> Result<Runtime> {
    let db = open_database(config).await?;
    runtime_for(db, config)
}

/// Wire the engine over an already opened database.
pub fn runtime_for(db: Database, config: &AppConfig) -> Result<Runtime> {
    let mut builder = AutomationEngine::builder(db.clone()).config(config.engine.clone());
    if let Some(channel) = build_channel(&config.channels)? {
        builder = builder.channel(channel);
    }
    if let Some(ai) = build_ai(config)? {
        builder = builder.ai_responder(ai);
    }

    Ok(Runtime {
        engine: builder.build(),
        schedules: ScheduleStore::new(db.clone()),
        executions: ExecutionLogStore::new(db),
    })
}

/// Build the outbound channel from `[channels]`. `None` when nothing is
/// configured.
pub fn build_channel(channels: &ChannelsConfig) -> Result<Option<Arc<dyn MessageChannel>>> {
    if channels.dry_run {
        info!("dry-run mode: deliveries are logged, not sent");
        return Ok(Some(Arc::new(DryRunChannel::new())));
    }

    let mut router = ChannelRouter::new();
    if let Some(token) = channels.telegram_bot_token.as_deref().filter(|t| !t.is_empty()) {
        router = router.with(Arc::new(
            TelegramChannel::new(token).context("failed to set up Telegram channel")?,
        ));
        info!(platform = "telegram", "channel configured");
    }
    for (platform, url) in &channels.webhooks {
        let channel = WebhookChannel::new(platform.clone(), url)
            .with_context(|| format!("failed to set up webhook for {platform}"))?;
        router = router.with(Arc::new(channel));
        info!(%platform, "webhook channel configured");
    }

    if router.is_empty() {
        warn!("no delivery channel configured; send_message and ai_response are unavailable");
        return Ok(None);
    }
    Ok(Some(Arc::new(router)))
}

fn build_ai(config: &AppConfig) -> Result<Option<Arc<dyn AiResponder>>> {
    if config.ai.api_key.trim().is_empty() {
        return Ok(None);
    }
    let responder =
        OpenAiResponder::new(config.ai.clone()).context("failed to set up AI responder")?;
    info!(model = %responder.model(), "AI responder configured");
    Ok(Some(Arc::new(responder)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_configured_means_no_channel() {
        assert!(build_channel(&ChannelsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn dry_run_supports_any_platform() {
        let channel = build_channel(&ChannelsConfig {
            dry_run: true,
            telegram_bot_token: Some("123:abc".into()),
            ..ChannelsConfig::default()
        })
        .unwrap()
        .unwrap();
        assert!(channel.supports("viber"));
    }

    #[test]
    fn configured_platforms_are_routed() {
        let mut channels = ChannelsConfig {
            telegram_bot_token: Some("123:abc".into()),
            ..ChannelsConfig::default()
        };
        channels
            .webhooks
            .insert("whatsapp".into(), "https://hooks.example.com/wa".into());

        let channel = build_channel(&channels).unwrap().unwrap();
        assert!(channel.supports("telegram"));
        assert!(channel.supports("whatsapp"));
        assert!(!channel.supports("sms"));
    }

    #[test]
    fn bad_webhook_url_is_a_startup_error() {
        let mut channels = ChannelsConfig::default();
        channels.webhooks.insert("sms".into(), "not a url".into());
        assert!(build_channel(&channels).is_err());
    }

    #[tokio::test]
    async fn builtins_follow_configured_collaborators() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let config = AppConfig {
            channels: ChannelsConfig {
                dry_run: true,
                ..ChannelsConfig::default()
            },
            ..AppConfig::default()
        };
        let runtime = runtime_for(db, &config).unwrap();
        let types = runtime.engine.registry().action_types();
        assert!(types.contains(&"send_message".to_string()));
        assert!(!types.contains(&"ai_response".to_string()));
    }
}
