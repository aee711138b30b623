//! Narrow interfaces into the surrounding support platform.
//!
//! The engine never talks to a messaging platform or a model API
//! directly. It goes through these two traits, implemented by the
//! `supportflow-adapters` crate (or by test doubles).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// Acknowledgement of a delivered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub platform: String,
    /// Platform-side message id, when the platform reports one.
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("no channel for platform `{0}`")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),
}

/// Delivers text to an identity on a messaging platform.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Whether `deliver` can handle `platform`.
    fn supports(&self, platform: &str) -> bool;

    async fn deliver(
        &self,
        platform: &str,
        address: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, ChannelError>;
}

// ---------------------------------------------------------------------------
// AI generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub use_knowledge_base: bool,
    pub max_documents: u32,
}

/// A generated answer plus the usage metadata stamped on stored messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAnswer {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub documents_used: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct GenerationError(pub String);

/// Produces an AI answer for a prompt.
#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn generate(&self, request: AiRequest) -> Result<AiAnswer, GenerationError>;
}
