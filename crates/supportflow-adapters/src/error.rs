//! Adapter error types.
//!
//! All adapters surface errors through [`AdapterError`]. At the engine
//! boundary they are folded into the port error types
//! ([`ChannelError`], [`GenerationError`]).

use supportflow_engine::{ChannelError, GenerationError};

/// Unified error type for SupportFlow adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The HTTP request could not be sent or its body not read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote service answered with an error.
    #[error("{service} API error: {reason}")]
    Api { service: &'static str, reason: String },

    /// A required credential is not configured.
    #[error("authentication required for {provider}")]
    AuthRequired { provider: &'static str },

    /// The remote service answered with something we cannot interpret.
    #[error("invalid response from {service}: {reason}")]
    InvalidResponse { service: &'static str, reason: String },

    /// Configuration error in adapter setup.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the adapters crate.
pub type Result<T> = std::result::Result<T, AdapterError>;

impl From<AdapterError> for ChannelError {
    fn from(err: AdapterError) -> Self {
        ChannelError::Failed(err.to_string())
    }
}

impl From<AdapterError> for GenerationError {
    fn from(err: AdapterError) -> Self {
        GenerationError(err.to_string())
    }
}
