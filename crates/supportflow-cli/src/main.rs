//! CLI entry point for SupportFlow.
//!
//! This binary provides the `supportflow` command: it runs the automation
//! engine with its scheduler and exposes operability subcommands for
//! rules, schedules and the execution audit trail.

mod cli;
mod commands;
mod config;
mod wiring;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, RuleAction, ScheduleAction};
use crate::config::{AppConfig, LogFormat};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_tracing(
        &config.logging.level,
        cli.log_format.unwrap_or(config.logging.format),
    );

    let runtime = wiring::build_runtime(&config).await?;

    match cli.command {
        Commands::Run => commands::cmd_run(runtime).await,
        Commands::Rules { action } => match action {
            RuleAction::List { all } => commands::cmd_rules_list(&runtime, all).await,
            RuleAction::Import { file } => commands::cmd_rules_import(&runtime, &file).await,
            RuleAction::SetStatus { rule_id, status } => {
                commands::cmd_rules_set_status(&runtime, &rule_id, &status).await
            }
        },
        Commands::Fire {
            rule_id,
            user,
            conversation,
            data,
        } => commands::cmd_fire(&runtime, &rule_id, user, conversation, data.as_deref()).await,
        Commands::Emit {
            event_type,
            user,
            conversation,
            message,
            data,
        } => {
            commands::cmd_emit(
                &runtime,
                &event_type,
                user,
                conversation,
                message,
                data.as_deref(),
            )
            .await
        }
        Commands::History { rule_id, limit } => {
            commands::cmd_history(&runtime, &rule_id, limit).await
        }
        Commands::Schedules { action } => match action {
            ScheduleAction::List => commands::cmd_schedules_list(&runtime).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber. `RUST_LOG` overrides `default_level`.
///
/// Logs go to stderr so that JSON printed by subcommands stays clean.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Compact => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
