//! Provider identity and per-call outcome records.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Unique name of a configured provider (e.g. `"openai"`, `"bedrock-eu"`).
///
/// Cheap to clone; every component refers to a provider by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0.to_string()
    }
}

impl AsRef<str> for ProviderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a single call attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    /// The provider did not answer within its configured timeout.
    Timeout,
}

impl OutcomeKind {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Failures and timeouts both count against the provider.
    pub fn is_failure(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One completed or failed call attempt.
///
/// Produced by the router after each invocation and consumed immediately by
/// the provider's metrics window and breaker.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub provider: ProviderId,
    /// When the attempt finished (monotonic).
    pub at: Instant,
    pub latency: Duration,
    pub kind: OutcomeKind,
}

impl CallOutcome {
    pub fn new(provider: impl Into<ProviderId>, kind: OutcomeKind, latency: Duration) -> Self {
        Self {
            provider: provider.into(),
            at: crate::clock::now(),
            latency,
            kind,
        }
    }

    pub fn success(provider: impl Into<ProviderId>, latency: Duration) -> Self {
        Self::new(provider, OutcomeKind::Success, latency)
    }

    pub fn failure(provider: impl Into<ProviderId>, latency: Duration) -> Self {
        Self::new(provider, OutcomeKind::Failure, latency)
    }

    pub fn timeout(provider: impl Into<ProviderId>, latency: Duration) -> Self {
        Self::new(provider, OutcomeKind::Timeout, latency)
    }

    /// Override the completion instant.
    pub fn at(mut self, at: Instant) -> Self {
        self.at = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_serde_is_plain_string() {
        let id = ProviderId::from("anthropic");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"anthropic\"");
        let back: ProviderId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn timeout_counts_as_failure() {
        assert!(OutcomeKind::Timeout.is_failure());
        assert!(OutcomeKind::Failure.is_failure());
        assert!(!OutcomeKind::Success.is_failure());
    }
}
