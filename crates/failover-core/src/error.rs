//! Error types for dispatch, configuration, persistence and provider calls.

use thiserror::Error;

use crate::provider::ProviderId;

/// A single provider invocation failed.
///
/// Returned by [`ProviderInvoker`](crate::invoker::ProviderInvoker)
/// implementations. The router absorbs these: each one is recorded against
/// the provider's window and breaker, then the next provider is tried.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection refused, reset, DNS failure, etc.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with an error status.
    #[error("provider returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// Anything else the invoker wants to report.
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to the caller of `dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every eligible provider was breaker-rejected or failed.
    ///
    /// `attempted` counts providers that were invoked and failed or timed
    /// out; `rejected` counts providers skipped by their breaker. Per-provider
    /// detail is available through the health reporter.
    #[error("all providers unavailable ({attempted} failed, {rejected} rejected by circuit breaker)")]
    AllProvidersUnavailable { attempted: usize, rejected: usize },

    /// The provider list handed to the router is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A provider id in an explicit dispatch list is not registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(ProviderId),
}

impl DispatchError {
    /// Returns `true` for the terminal "nobody could serve this" outcome.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::AllProvidersUnavailable { .. })
    }
}

/// Invalid provider list or thresholds. Raised at startup or registration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider list is empty")]
    EmptyProviderList,

    #[error("provider '{0}' is configured more than once")]
    DuplicateProvider(ProviderId),

    #[error("provider '{provider}': invalid {field}: {reason}")]
    InvalidThreshold {
        provider: ProviderId,
        field: &'static str,
        reason: String,
    },

    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(String),
}

/// Store adapter failures. Logged and counted, never returned from dispatch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("snapshot (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable")]
    Unavailable,
}
