//! The target health oracle interface.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use ebb_core::Reading;

/// Load balancer target health, as seen by the coordinator. Polling only.
#[async_trait]
pub trait TargetHealthOracle: Send + Sync {
    /// Whether the target is registered and receiving traffic.
    async fn is_in_service(&self, instance_id: &str) -> anyhow::Result<bool>;

    /// Whether the load balancer still routes new connections to the target.
    async fn is_registered(&self, instance_id: &str) -> anyhow::Result<bool>;

    /// Ask the load balancer to stop routing new connections to the target.
    /// Established sticky connections keep flowing until the load
    /// balancer's own deregistration delay expires.
    async fn request_deregistration(&self, instance_id: &str) -> anyhow::Result<()>;
}

fn reading_from_poll(
    result: Result<anyhow::Result<bool>, tokio::time::error::Elapsed>,
    what: &str,
    id: &str,
) -> Reading {
    match result {
        Ok(Ok(true)) => Reading::Yes,
        Ok(Ok(false)) => Reading::No,
        Ok(Err(e)) => {
            debug!(instance = %id, error = %e, "{what} poll failed");
            Reading::Unknown
        }
        Err(_) => {
            debug!(instance = %id, "{what} poll timed out");
            Reading::Unknown
        }
    }
}

/// Poll `is_in_service` with a timeout.
pub async fn probe_in_service(
    oracle: &dyn TargetHealthOracle,
    instance_id: &str,
    timeout: Duration,
) -> Reading {
    let result = tokio::time::timeout(timeout, oracle.is_in_service(instance_id)).await;
    reading_from_poll(result, "in-service", instance_id)
}

/// Poll `is_registered` with a timeout.
pub async fn probe_registered(
    oracle: &dyn TargetHealthOracle,
    instance_id: &str,
    timeout: Duration,
) -> Reading {
    let result = tokio::time::timeout(timeout, oracle.is_registered(instance_id)).await;
    reading_from_poll(result, "registration", instance_id)
}
