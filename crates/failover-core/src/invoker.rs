//! The seam between the router and real provider clients.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::ProviderId;

/// Issues one request to one provider.
///
/// The router owns retries, timeouts and failover; an implementation only
/// performs a single attempt. `timeout` is the provider's configured deadline,
/// passed so transports can set their own socket limits. The router enforces
/// it regardless.
#[async_trait]
pub trait ProviderInvoker: Send + Sync + 'static {
    type Request: Send + Sync;
    type Response: Send;

    async fn invoke(
        &self,
        provider: &ProviderId,
        request: &Self::Request,
        timeout: Duration,
    ) -> Result<Self::Response, ProviderError>;

    /// Lightweight liveness check used by the background health monitor.
    ///
    /// The default reports every provider healthy; clients with a cheap
    /// ping or model-list endpoint should override it.
    async fn health_check(
        &self,
        _provider: &ProviderId,
        _timeout: Duration,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}
