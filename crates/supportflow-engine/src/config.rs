//! Engine tuning knobs.
//!
//! Deserialized from the `[engine]` table of the application config; every
//! field has a default so an empty table is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for a single handler invocation.
    pub handler_timeout_secs: u64,
    /// Upper bound for AI generation plus delivery.
    pub ai_timeout_secs: u64,
    /// Window for `time_based` triggers. Values above 60 are clamped.
    pub time_based_tolerance_secs: i64,
    /// Cap for per-action `delay` and the `delay` action.
    pub max_action_delay_secs: u64,
    /// `conversation_inactive` threshold when the rule does not set one.
    pub default_inactivity_minutes: i64,
    /// Look-back window for the `by_availability` assignment strategy.
    pub assignment_window_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 30,
            ai_timeout_secs: 90,
            time_based_tolerance_secs: 60,
            max_action_delay_secs: 3600,
            default_inactivity_minutes: 30,
            assignment_window_minutes: 60,
        }
    }
}

impl EngineConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn max_action_delay(&self) -> Duration {
        Duration::from_secs(self.max_action_delay_secs)
    }

    /// Tolerance actually applied to `time_based` triggers.
    pub fn time_based_tolerance(&self) -> i64 {
        self.time_based_tolerance_secs.clamp(0, 60)
    }
}
