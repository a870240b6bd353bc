//! Background consumer of the router's breaker event stream.

use failover_core::{BreakerEvent, CircuitState};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::metrics::FailoverMetrics;

/// Count every breaker transition until the router is dropped.
///
/// Resolves to the number of events recorded. A receiver that falls behind
/// logs how many events it missed and keeps going.
pub fn spawn_event_recorder(
    mut events: broadcast::Receiver<BreakerEvent>,
    metrics: FailoverMetrics,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut recorded = 0u64;
        loop {
            match events.recv().await {
                Ok(event) => {
                    metrics.record_transition(&event);
                    recorded += 1;
                    if event.to == CircuitState::Open {
                        tracing::debug!(
                            provider = %event.provider,
                            reason = ?event.reason,
                            at_ms = event.at_ms,
                            "breaker event recorded"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "breaker event recorder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        recorded
    })
}
