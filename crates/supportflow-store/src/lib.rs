//! # supportflow-store
//!
//! SQLite persistence for the SupportFlow automation engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  RuleStore          rules + atomic claims     │
//! │  ScheduleStore      cron bindings             │
//! │  ExecutionLogStore  append-only audit trail   │
//! │  DirectoryStore     users / operators /       │
//! │                     conversations / messages  │
//! ├───────────────────────────────────────────────┤
//! │  Database (rusqlite, WAL, spawn_blocking)     │
//! │  Migrations (versioned, transactional)        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use supportflow_store::{Database, RuleStore};
//!
//! let db = Database::open_and_migrate("data/supportflow.db").await?;
//! let rules = RuleStore::new(db.clone());
//! for rule in rules.list_active().await? {
//!     println!("{} ({})", rule.name, rule.trigger_type);
//! }
//! ```

pub mod db;
pub mod directory;
pub mod error;
pub mod execution_log;
pub mod migration;
pub mod rule_store;
pub mod schedule_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use directory::{
    Conversation, DirectoryStore, Message, MessageSender, NewUser, Operator, OperatorLoad,
    SupportUser,
};
pub use error::{StoreError, StoreResult};
pub use execution_log::{ExecutionLogStore, ExecutionRecord, ExecutionStatus, NewExecutionRecord};
pub use rule_store::{ActionSpec, NewRule, Rule, RuleStatus, RuleStore, TriggerKind};
pub use schedule_store::{Schedule, ScheduleStore};
