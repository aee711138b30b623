//! Outbound adapters for the SupportFlow automation engine.
//!
//! Implementations of the engine's [`MessageChannel`] and [`AiResponder`]
//! ports:
//!
//! - [`TelegramChannel`]: Telegram Bot API `sendMessage`.
//! - [`WebhookChannel`]: JSON POST to an arbitrary HTTP endpoint.
//! - [`DryRunChannel`]: logs messages without sending them.
//! - [`ChannelRouter`]: picks a channel by platform.
//! - [`OpenAiResponder`]: OpenAI-compatible chat completions.
//!
//! [`MessageChannel`]: supportflow_engine::MessageChannel
//! [`AiResponder`]: supportflow_engine::AiResponder

pub mod dry_run;
pub mod error;
pub mod openai;
pub mod router;
pub mod telegram;
pub mod webhook;

pub use dry_run::{DryRunChannel, DryRunDelivery};
pub use error::{AdapterError, Result};
pub use openai::{DEFAULT_OPENAI_BASE_URL, OpenAiConfig, OpenAiResponder};
pub use router::ChannelRouter;
pub use telegram::{TELEGRAM_PLATFORM, TelegramChannel};
pub use webhook::WebhookChannel;
