//! Policies shared by the breaker, router and snapshot flusher.
//!
//! - [`backoff`]: cooldown growth after failed half-open trials, and the
//!   bounded retry schedule for snapshot pushes
//! - [`selection`]: the order in which the router tries providers

pub mod backoff;
pub mod selection;

pub use backoff::{CooldownBackoff, RetryConfig, RetryPolicy};
pub use selection::{RankInfo, SelectionPolicy};
