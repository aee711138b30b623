//! Generic HTTP webhook delivery channel.
//!
//! POSTs `{platform, address, text, sent_at}` as JSON to a configured URL.
//! Any 2xx answer counts as delivered; a `message_id` or `id` field in a
//! JSON answer becomes the receipt id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use supportflow_engine::{ChannelError, DeliveryReceipt, MessageChannel};
use tracing::debug;
use url::Url;

use crate::error::{AdapterError, Result};

#[derive(Debug, Clone)]
pub struct WebhookChannel {
    platform: String,
    url: Url,
    http: reqwest::Client,
}

impl WebhookChannel {
    /// A channel serving `platform` that posts to `url`.
    pub fn new(platform: impl Into<String>, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| AdapterError::Config(format!("invalid webhook url `{url}`: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AdapterError::Config(format!(
                "webhook url must be http(s), got `{}`",
                url.scheme()
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            platform: platform.into(),
            url,
            http,
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    async fn post(&self, address: &str, text: &str) -> Result<Option<String>> {
        let body = json!({
            "platform": self.platform,
            "address": address,
            "text": text,
            "sent_at": Utc::now().to_rfc3339(),
        });
        debug!(platform = %self.platform, url = %self.url, "posting webhook message");

        let response = self.http.post(self.url.clone()).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AdapterError::Api {
                service: "webhook",
                reason: format!("{status}: {text}"),
            });
        }

        let message_id = serde_json::from_str::<Value>(&text).ok().and_then(|v| {
            ["message_id", "id"].iter().find_map(|key| match v.get(*key)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        });
        Ok(message_id)
    }
}

#[async_trait]
impl MessageChannel for WebhookChannel {
    fn supports(&self, platform: &str) -> bool {
        platform == self.platform
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
        let message_id = self.post(address, text).await?;
        Ok(DeliveryReceipt {
            platform: self.platform.clone(),
            message_id,
        })
    }
}
