use relay_core::{FailoverReason, RelayError, RelayResult, DEFAULT_USAGE_THRESHOLDS};
use relay_resilience::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Turn runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Turns allowed per execution unless the call overrides it.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Retry schedule for one round trip.
    #[serde(default)]
    pub retry: BackoffPolicy,
    /// Context window used for usage ratios, in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    /// Usage ratios that trigger a warning once each.
    #[serde(default = "default_usage_thresholds")]
    pub usage_thresholds: Vec<f64>,
    /// Failure reasons worth re-issuing a round trip for.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<FailoverReason>,
}

fn default_max_turns() -> u32 {
    20
}

fn default_context_window() -> u64 {
    200_000
}

fn default_usage_thresholds() -> Vec<f64> {
    DEFAULT_USAGE_THRESHOLDS.to_vec()
}

fn default_retry_on() -> Vec<FailoverReason> {
    vec![
        FailoverReason::RateLimit,
        FailoverReason::ServerError,
        FailoverReason::Timeout,
        FailoverReason::ModelUnavailable,
    ]
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            retry: BackoffPolicy::default(),
            context_window: default_context_window(),
            usage_thresholds: default_usage_thresholds(),
            retry_on: default_retry_on(),
        }
    }
}

impl RunnerConfig {
    /// Rejects settings the runner cannot work with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.max_turns == 0 {
            return Err(RelayError::Config("max_turns must be at least 1".into()));
        }
        if let Some(bad) = self
            .usage_thresholds
            .iter()
            .find(|t| !(**t > 0.0 && **t <= 1.0))
        {
            return Err(RelayError::Config(format!(
                "usage threshold {bad} is outside (0, 1]"
            )));
        }
        Ok(())
    }
}
