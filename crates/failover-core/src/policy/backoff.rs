//! Exponential backoff for store push retries and breaker cooldowns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry schedule for snapshot pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 5_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        Some(grow(
            Duration::from_millis(self.config.initial_backoff_ms),
            self.config.multiplier,
            attempt - 1,
            Duration::from_millis(self.config.max_backoff_ms),
        ))
    }
}

/// How the open-state cooldown grows after consecutive failed half-open trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CooldownBackoff {
    /// Always wait the base cooldown.
    #[default]
    Fixed,
    /// `base * multiplier^k` after the k-th failed trial, capped at `max_cooldown_ms`.
    Exponential { multiplier: f64, max_cooldown_ms: u64 },
}

impl CooldownBackoff {
    /// Cooldown to apply after `failed_trials` consecutive failed half-open trials.
    pub fn cooldown_for(&self, base: Duration, failed_trials: u32) -> Duration {
        match self {
            Self::Fixed => base,
            Self::Exponential { multiplier, max_cooldown_ms } => grow(
                base,
                *multiplier,
                failed_trials,
                Duration::from_millis(*max_cooldown_ms).max(base),
            ),
        }
    }
}

fn grow(base: Duration, multiplier: f64, exponent: u32, cap: Duration) -> Duration {
    let factor = multiplier.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
    let ms = (base.as_millis() as f64 * factor).min(cap.as_millis() as f64);
    Duration::from_millis(ms as u64)
}
