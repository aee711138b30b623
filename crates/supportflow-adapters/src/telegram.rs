//! Telegram Bot API delivery channel.
//!
//! Sends plain-text messages with `sendMessage`. The user's platform
//! address is the Telegram chat id.

use async_trait::async_trait;
use serde_json::{Value, json};
use supportflow_engine::{ChannelError, DeliveryReceipt, MessageChannel};
use tracing::debug;

use crate::error::{AdapterError, Result};

/// Telegram Bot API base URL. All method calls are POSTed to
/// `{BASE_URL}{bot_token}/{method}`.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

/// Platform tag served by this channel.
pub const TELEGRAM_PLATFORM: &str = "telegram";

/// Telegram delivery channel authenticated with a bot token from
/// [@BotFather](https://t.me/BotFather).
#[derive(Debug, Clone)]
pub struct TelegramChannel {
    bot_token: String,
    base_url: String,
    http: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: impl Into<String>) -> Result<Self> {
        let bot_token = bot_token.into();
        if bot_token.trim().is_empty() {
            return Err(AdapterError::AuthRequired {
                provider: TELEGRAM_PLATFORM,
            });
        }
        let http = reqwest::Client::builder()
            .user_agent("SupportFlow/0.1")
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            bot_token,
            base_url: TELEGRAM_API_BASE.to_string(),
            http,
        })
    }

    /// Point the channel at another API host, e.g. a local Bot API server.
    /// `base_url` must end right before the token (`.../bot`).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build a full Telegram Bot API URL for the given method.
    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", self.base_url, self.bot_token, method)
    }

    /// Send a text message and return the API's `result` object.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<Value> {
        let url = self.api_url("sendMessage");
        debug!(chat_id = %chat_id, "sending Telegram message");

        let response: Value = self
            .http
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?
            .json()
            .await?;

        parse_telegram_response(&response)?;
        Ok(response.get("result").cloned().unwrap_or(json!({})))
    }
}

/// Check a Bot API response envelope.
///
/// Telegram answers `{ "ok": true, "result": {...} }` on success and
/// `{ "ok": false, "error_code": 400, "description": "..." }` on failure.
pub fn parse_telegram_response(response: &Value) -> Result<()> {
    if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(());
    }
    let error_code = response
        .get("error_code")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let description = response
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(AdapterError::Api {
        service: "telegram",
        reason: format!("code {error_code}: {description}"),
    })
}

#[async_trait]
impl MessageChannel for TelegramChannel {
    fn supports(&self, platform: &str) -> bool {
        platform == TELEGRAM_PLATFORM
    }

    async fn deliver(
        &self,
        platform: &str,
        address: &str,
        text: &str,
    ) -> std::result::Result<DeliveryReceipt, ChannelError> {
        if !self.supports(platform) {
            return Err(ChannelError::Unsupported(platform.to_string()));
        }
        let result = self.send_message(address, text).await?;
        Ok(DeliveryReceipt {
            platform: TELEGRAM_PLATFORM.to_string(),
            message_id: result.get("message_id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(
            TelegramChannel::new("  "),
            Err(AdapterError::AuthRequired { provider: "telegram" })
        ));
    }

    #[test]
    fn api_url_embeds_token() {
        let channel = TelegramChannel::new("123:abc").unwrap();
        assert_eq!(
            channel.api_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn error_envelope_is_reported() {
        let err = parse_telegram_response(&json!({
            "ok": false,
            "error_code": 403,
            "description": "Forbidden: bot was blocked by the user"
        }))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "telegram API error: code 403: Forbidden: bot was blocked by the user"
        );
        assert!(parse_telegram_response(&json!({"ok": true, "result": {}})).is_ok());
    }
}
