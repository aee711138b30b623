//! AI responder backed by an OpenAI-compatible chat completions API.
//!
//! Works with OpenAI itself and with any provider exposing the same
//! `/chat/completions` shape (DeepSeek, Groq, local Ollama, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use supportflow_engine::{AiAnswer, AiRequest, AiResponder, GenerationError};
use tracing::{debug, instrument};

use crate::error::{AdapterError, Result};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful customer support assistant. \
Answer the customer's message briefly and politely. If you do not know the answer, \
say that a human operator will follow up.";

/// Connection settings for [`OpenAiResponder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout_secs: 60,
        }
    }
}

pub struct OpenAiResponder {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiResponder {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::AuthRequired { provider: "openai" });
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_body(&self, request: &AiRequest) -> Value {
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [
                { "role": "system", "content": self.config.system_prompt },
                { "role": "user", "content": request.prompt },
            ],
        })
    }

    #[instrument(skip(self, request), fields(model = %self.config.model))]
    async fn complete(&self, request: &AiRequest) -> Result<AiAnswer> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| AdapterError::Config(format!("invalid authorization header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        debug!(url = %url, "sending completion request");

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Api {
                service: "openai",
                reason: format!("API returned {status}: {text}"),
            });
        }

        let body: Value = response.json().await?;
        parse_completion(&body, &self.config.model)
    }
}

/// Extract the answer text and token usage from a chat completion.
pub fn parse_completion(v: &Value, fallback_model: &str) -> Result<AiAnswer> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AdapterError::InvalidResponse {
            service: "openai",
            reason: "missing `choices[0].message` in response".into(),
        });
    }
    let text = message["content"].as_str().unwrap_or_default().trim().to_owned();
    if text.is_empty() {
        return Err(AdapterError::InvalidResponse {
            service: "openai",
            reason: "empty completion".into(),
        });
    }

    let usage = &v["usage"];
    let tokens = |key: &str| usage[key].as_u64().unwrap_or(0) as u32;

    Ok(AiAnswer {
        text,
        model: v["model"].as_str().unwrap_or(fallback_model).to_owned(),
        prompt_tokens: tokens("prompt_tokens"),
        completion_tokens: tokens("completion_tokens"),
        documents_used: 0,
    })
}

#[async_trait]
impl AiResponder for OpenAiResponder {
    async fn generate(&self, request: AiRequest) -> std::result::Result<AiAnswer, GenerationError> {
        Ok(self.complete(&request).await?)
    }
}
