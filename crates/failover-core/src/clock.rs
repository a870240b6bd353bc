//! Monotonic clock for breaker and window decisions.

use std::time::Instant;

/// Current instant from Tokio's clock, so paused-time tests drive the
/// breaker cooldowns as well as the timeouts.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
