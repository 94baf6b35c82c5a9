//! ebbgrid-pods — the pod lifecycle manager interface.
//!
//! Backend instances are created and destroyed by an external manager
//! (a container orchestrator, a VM API, a simulator). The coordinator
//! talks to it only through [`PodLifecycleManager`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ebb_core::{Generation, GenerationSpec, InstanceId, Reading};

/// A pod as reported by the manager's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: InstanceId,
    pub generation: Generation,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
}

/// Creates and destroys backend instances.
#[async_trait]
pub trait PodLifecycleManager: Send + Sync {
    /// Start an instance of `spec`. Returns its record once accepted; the
    /// instance is usually not ready yet.
    async fn create(&self, spec: &GenerationSpec) -> anyhow::Result<PodRecord>;

    /// Stop an instance, severing whatever connections remain.
    async fn stop(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn is_ready(&self, instance_id: &str) -> anyhow::Result<bool>;

    /// Every instance that has not been stopped.
    async fn list(&self) -> anyhow::Result<Vec<PodRecord>>;
}

/// Poll `is_ready` with a timeout.
pub async fn probe_ready(
    pods: &dyn PodLifecycleManager,
    instance_id: &str,
    timeout: Duration,
) -> Reading {
    match tokio::time::timeout(timeout, pods.is_ready(instance_id)).await {
        Ok(Ok(true)) => Reading::Yes,
        Ok(Ok(false)) => Reading::No,
        Ok(Err(e)) => {
            debug!(instance = %instance_id, error = %e, "readiness poll failed");
            Reading::Unknown
        }
        Err(_) => {
            debug!(instance = %instance_id, "readiness poll timed out");
            Reading::Unknown
        }
    }
}
