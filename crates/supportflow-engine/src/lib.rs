//! SupportFlow automation engine.
//!
//! Turns support-platform events into rule firings:
//!
//! - **[`engine`]** -- the dispatcher. Loads active rules in priority order,
//!   matches them, claims a firing atomically and records an audit entry.
//! - **[`matcher`]** -- per-trigger-type predicates (aho-corasick keyword
//!   matching, message counts, inactivity, custom events) plus the
//!   [`conditions`] block (business hours via `chrono-tz`, audience filters).
//! - **[`executor`]** -- runs an action list in order with per-action
//!   delays, timeouts and panic isolation.
//! - **[`registry`]** -- [`DashMap`](dashmap::DashMap)-backed map from
//!   action-type tag to [`ActionHandler`]; the built-ins live in
//!   [`handlers`].
//! - **[`logger`]** -- the append-only execution log writer.
//! - **[`scheduler`]** -- one tokio timer per cron schedule.
//! - **[`ports`]** -- the messaging and AI traits implemented outside the
//!   engine.
//!
//! All public types are `Send + Sync`; the engine handle is cheap to clone
//! and may be driven from many tasks at once.

pub mod conditions;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod logger;
pub mod matcher;
pub mod ports;
pub mod registry;
pub mod scheduler;

pub use config::EngineConfig;
pub use context::{ESCALATION_NEEDED, SCHEDULED_EXECUTION, TriggerContext};
pub use engine::{AutomationEngine, EngineBuilder, RuleFiring};
pub use error::{ActionError, EngineError, Result};
pub use executor::{ActionExecutor, ExecutionResult, aggregate_status};
pub use logger::ExecutionLogger;
pub use matcher::TriggerMatcher;
pub use ports::{
    AiAnswer, AiRequest, AiResponder, ChannelError, DeliveryReceipt, GenerationError,
    MessageChannel,
};
pub use registry::{ActionHandler, BuiltinAction, HandlerRegistry};
pub use scheduler::RuleScheduler;
