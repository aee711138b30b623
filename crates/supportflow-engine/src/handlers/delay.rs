//! `delay`: pause the action list.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use supportflow_store::ActionSpec;

use super::parse_config;
use crate::context::TriggerContext;
use crate::error::ActionError;
use crate::registry::{ActionHandler, BuiltinAction};

/// Headroom over the requested sleep before the executor gives up.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DelayConfig {
    seconds: u64,
}

pub struct DelayHandler {
    max: Duration,
}

impl DelayHandler {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }

    fn duration(&self, action: &ActionSpec) -> Result<Duration, ActionError> {
        let config: DelayConfig = parse_config(action)?;
        Ok(Duration::from_secs(config.seconds).min(self.max))
    }
}

#[async_trait]
impl ActionHandler for DelayHandler {
    fn action_type(&self) -> &str {
        BuiltinAction::Delay.as_str()
    }

    async fn execute(&self, action: &ActionSpec, _ctx: &TriggerContext) -> Result<Value, ActionError> {
        let duration = self.duration(action)?;
        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_seconds": duration.as_secs() }))
    }

    fn timeout(&self, action: &ActionSpec) -> Option<Duration> {
        self.duration(action).ok().map(|d| d + TIMEOUT_SLACK)
    }
}
