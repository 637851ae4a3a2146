use serde::{Deserialize, Serialize};
use tracing::warn;

/// Token counts reported by a provider.
///
/// Used both as a running total and as a delta; a field a provider does not
/// report deserializes to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache.
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Tokens written to the provider's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Adds `other` field by field, saturating.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
    }

    /// Sum of every field.
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }

    /// Whether nothing has been counted.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Emitted the first time cumulative usage crosses a configured ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdWarning {
    /// The threshold that was crossed, as a fraction of the window.
    pub threshold: f64,
    /// Usage ratio at the time of the check.
    pub ratio: f64,
    /// Input tokens counted so far.
    pub input_tokens: u64,
    /// Configured context window.
    pub context_window: u64,
}

/// Default warning thresholds: 80% and 95% of the context window.
pub const DEFAULT_USAGE_THRESHOLDS: [f64; 2] = [0.8, 0.95];

/// Accumulates usage for one execution and fires threshold warnings once each.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    usage: TokenUsage,
    context_window: u64,
    thresholds: Vec<f64>,
    fired: Vec<bool>,
}

impl TokenCounter {
    /// Creates a counter with the default thresholds.
    pub fn new(context_window: u64) -> Self {
        Self::with_thresholds(context_window, &DEFAULT_USAGE_THRESHOLDS)
    }

    /// Creates a counter with custom thresholds (sorted and deduplicated;
    /// values outside `(0, 1]` are dropped).
    pub fn with_thresholds(context_window: u64, thresholds: &[f64]) -> Self {
        let mut thresholds: Vec<f64> = thresholds
            .iter()
            .copied()
            .filter(|t| *t > 0.0 && *t <= 1.0)
            .collect();
        thresholds.sort_by(f64::total_cmp);
        thresholds.dedup();
        let fired = vec![false; thresholds.len()];
        Self {
            usage: TokenUsage::default(),
            context_window,
            thresholds,
            fired,
        }
    }

    /// Folds a usage delta into the running total.
    pub fn add(&mut self, delta: &TokenUsage) {
        self.usage.accumulate(delta);
    }

    /// Running total.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// `input_tokens / context_window`, or 0 without a window.
    pub fn usage_ratio(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.usage.input_tokens as f64 / self.context_window as f64
    }

    /// Tokens left in the window, never below zero.
    pub fn remaining(&self) -> u64 {
        self.context_window.saturating_sub(self.usage.input_tokens)
    }

    /// Fires `listener` for each threshold crossed since the last check,
    /// lowest first. Each threshold fires at most once per counter.
    pub fn check_thresholds<F>(&mut self, mut listener: F) -> usize
    where
        F: FnMut(&ThresholdWarning),
    {
        let ratio = self.usage_ratio();
        let mut fired_now = 0;
        for (threshold, fired) in self.thresholds.iter().zip(self.fired.iter_mut()) {
            if *fired || ratio < *threshold {
                continue;
            }
            *fired = true;
            fired_now += 1;
            let warning = ThresholdWarning {
                threshold: *threshold,
                ratio,
                input_tokens: self.usage.input_tokens,
                context_window: self.context_window,
            };
            warn!(
                threshold = warning.threshold,
                ratio = warning.ratio,
                input_tokens = warning.input_tokens,
                context_window = warning.context_window,
                "Context usage threshold crossed"
            );
            listener(&warning);
        }
        fired_now
    }
}
