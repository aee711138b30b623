//! Action handler registry.
//!
//! Maps an action-type tag to the [`ActionHandler`] that executes it. The
//! built-in tags are enumerated by [`BuiltinAction`]; deployments add their
//! own tags by registering further handlers. Lookups are lock-free via
//! [`DashMap`], and the registry is cheap to clone.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use serde_json::{Value, json};
//! # use supportflow_engine::{ActionError, ActionHandler, HandlerRegistry, TriggerContext};
//! # use supportflow_store::ActionSpec;
//! struct Echo;
//!
//! #[async_trait]
//! impl ActionHandler for Echo {
//!     fn action_type(&self) -> &str { "echo" }
//!     async fn execute(&self, action: &ActionSpec, _ctx: &TriggerContext) -> Result<Value, ActionError> {
//!         Ok(action.config.clone())
//!     }
//! }
//!
//! let registry = HandlerRegistry::new();
//! registry.register(Arc::new(Echo));
//! assert!(registry.resolve("echo").is_some());
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use supportflow_store::ActionSpec;

use crate::context::TriggerContext;
use crate::error::ActionError;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A unit of work behind an action-type tag.
///
/// Implementations validate their own slice of `action.config` and report
/// every failure as an [`ActionError`]; they never panic on bad input.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The tag this handler is registered under.
    fn action_type(&self) -> &str;

    /// Perform the side effect and return a JSON result payload.
    async fn execute(&self, action: &ActionSpec, ctx: &TriggerContext)
    -> Result<Value, ActionError>;

    /// Time budget for one invocation; `None` uses the engine default.
    fn timeout(&self, _action: &ActionSpec) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Built-in tags
// ---------------------------------------------------------------------------

/// The closed set of action types shipped with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAction {
    SendMessage,
    AiResponse,
    AssignToOperator,
    ChangeUserStatus,
    AddTag,
    Delay,
}

impl BuiltinAction {
    pub const ALL: [BuiltinAction; 6] = [
        Self::SendMessage,
        Self::AiResponse,
        Self::AssignToOperator,
        Self::ChangeUserStatus,
        Self::AddTag,
        Self::Delay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::AiResponse => "ai_response",
            Self::AssignToOperator => "assign_to_operator",
            Self::ChangeUserStatus => "change_user_status",
            Self::AddTag => "add_tag",
            Self::Delay => "delay",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == tag)
    }
}

impl std::fmt::Display for BuiltinAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<DashMap<String, Arc<dyn ActionHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its own tag, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        let tag = handler.action_type().to_string();
        if self.inner.insert(tag.clone(), handler).is_some() {
            tracing::warn!(action_type = %tag, "action handler replaced");
        } else {
            tracing::debug!(action_type = %tag, "action handler registered");
        }
    }

    pub fn unregister(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.inner.remove(action_type).map(|(_, handler)| handler)
    }

    pub fn resolve(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.inner.get(action_type).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.inner.contains_key(action_type)
    }

    /// Registered tags, sorted.
    pub fn action_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.action_types())
            .finish()
    }
}
