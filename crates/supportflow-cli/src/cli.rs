//! CLI argument definitions for SupportFlow.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::LogFormat;

/// SupportFlow -- automation rules engine for conversational support.
#[derive(Parser)]
#[command(
    name = "supportflow",
    version,
    about = "SupportFlow -- automation rules engine",
    long_about = "Runs trigger -> condition -> action rules against support conversations, \
                  fires cron schedules, and keeps an audit trail of every firing."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format. Overrides `[logging] format`.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the engine and its scheduler; stop with Ctrl-C.
    Run,

    /// Manage automation rules.
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Force-fire an active rule, bypassing trigger matching and cooldown.
    Fire {
        /// The rule id.
        rule_id: String,

        /// User the firing is about.
        #[arg(long)]
        user: Option<String>,

        /// Conversation the firing is about.
        #[arg(long)]
        conversation: Option<String>,

        /// Extra context data as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// Feed an event through the engine as if the platform emitted it.
    Emit {
        /// Event type, e.g. `message_received` or `order_shipped`.
        event_type: String,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        conversation: Option<String>,

        /// Id of the triggering message.
        #[arg(long)]
        message: Option<String>,

        /// Event data as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// Dump recent execution records of a rule.
    History {
        rule_id: String,

        /// Number of records to show, newest first.
        #[arg(long, short, default_value_t = 20)]
        limit: i64,
    },

    /// Inspect cron schedules.
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

/// Actions for managing rules.
#[derive(Subcommand)]
pub enum RuleAction {
    /// List rules ordered by priority.
    List {
        /// Include draft, paused and disabled rules.
        #[arg(long)]
        all: bool,
    },
    /// Create rules from a JSON file holding an array of rule definitions.
    Import {
        file: PathBuf,
    },
    /// Change a rule's lifecycle status.
    SetStatus {
        rule_id: String,
        /// One of `draft`, `active`, `paused`, `disabled`.
        status: String,
    },
}

/// Actions for inspecting schedules.
#[derive(Subcommand)]
pub enum ScheduleAction {
    /// List all schedules with their run counts.
    List,
}
