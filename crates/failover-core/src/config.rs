//! Router configuration, loaded once at startup.
//!
//! Durations are expressed in milliseconds so the same structs read cleanly
//! from YAML or JSON:
//!
//! ```yaml
//! selection: priority
//! providers:
//!   - id: primary
//!     priority: 1
//!     timeout_ms: 10000
//!     failure_threshold: 3
//!   - id: fallback
//!     priority: 2
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::policy::{CooldownBackoff, RetryConfig, SelectionPolicy};
use crate::provider::ProviderId;
use crate::window::WindowConfig;

/// Per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    /// Lower values are tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Deadline for a single invocation.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures (or timeouts) that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling error rate above which the breaker opens.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Samples required before the error rate is trusted.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
    /// Time spent open before the first half-open trial.
    #[serde(default = "default_open_cooldown_ms")]
    pub open_cooldown_ms: u64,
    #[serde(default)]
    pub cooldown_backoff: CooldownBackoff,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_trial_quota")]
    pub half_open_trial_quota: u32,
    /// Maximum samples kept in the rolling window.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Maximum sample age; `0` disables the time bound.
    #[serde(default = "default_window_time_bound_ms")]
    pub window_time_bound_ms: u64,
    /// Include failed calls' latencies in p50/p95.
    #[serde(default)]
    pub include_failure_latency: bool,
}

fn default_priority() -> u32 { 100 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_failure_threshold() -> u32 { 5 }
fn default_error_rate_threshold() -> f64 { 0.5 }
fn default_min_sample_size() -> usize { 10 }
fn default_open_cooldown_ms() -> u64 { 30_000 }
fn default_half_open_trial_quota() -> u32 { 3 }
fn default_window_capacity() -> usize { 1_000 }
fn default_window_time_bound_ms() -> u64 { 60_000 }

impl ProviderConfig {
    /// A provider with every threshold at its default.
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            priority: default_priority(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            min_sample_size: default_min_sample_size(),
            open_cooldown_ms: default_open_cooldown_ms(),
            cooldown_backoff: CooldownBackoff::default(),
            half_open_trial_quota: default_half_open_trial_quota(),
            window_capacity: default_window_capacity(),
            window_time_bound_ms: default_window_time_bound_ms(),
            include_failure_latency: false,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            error_rate_threshold: self.error_rate_threshold,
            min_sample_size: self.min_sample_size,
            open_cooldown: Duration::from_millis(self.open_cooldown_ms),
            cooldown_backoff: self.cooldown_backoff.clone(),
            half_open_trial_quota: self.half_open_trial_quota,
        }
    }

    pub fn window_config(&self, flush_interval: Option<Duration>) -> WindowConfig {
        WindowConfig {
            capacity: self.window_capacity,
            time_bound: (self.window_time_bound_ms > 0)
                .then(|| Duration::from_millis(self.window_time_bound_ms)),
            include_failure_latency: self.include_failure_latency,
            flush_interval,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidThreshold {
            provider: self.id.clone(),
            field,
            reason: reason.to_string(),
        };
        if self.id.as_str().trim().is_empty() {
            return Err(invalid("id", "must not be empty"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be greater than zero"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(invalid("error_rate_threshold", "must be in (0, 1]"));
        }
        if self.half_open_trial_quota == 0 {
            return Err(invalid("half_open_trial_quota", "must be at least 1"));
        }
        if self.window_capacity == 0 {
            return Err(invalid("window_capacity", "must be at least 1"));
        }
        if let CooldownBackoff::Exponential { multiplier, .. } = self.cooldown_backoff {
            if !(multiplier >= 1.0 && multiplier.is_finite()) {
                return Err(invalid("cooldown_backoff.multiplier", "must be a finite value >= 1"));
            }
        }
        Ok(())
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Minimum time between snapshot pushes per provider; `0` disables periodic pushes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Pending snapshots buffered for the background flusher.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub push_retry: RetryConfig,
}

fn default_flush_interval_ms() -> u64 { 10_000 }
fn default_channel_capacity() -> usize { 256 }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
            push_retry: RetryConfig::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl FailoverConfig {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            selection: SelectionPolicy::default(),
            persistence: PersistenceConfig::default(),
        }
    }

    /// Reject empty lists, duplicate ids and out-of-range thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::EmptyProviderList);
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.id.clone()) {
                return Err(ConfigError::DuplicateProvider(provider.id.clone()));
            }
        }
        if self.persistence.channel_capacity == 0 {
            return Err(ConfigError::Parse(
                "persistence.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }
}
