//! Rollout progress events.

use serde::Serialize;

use ebb_core::{Generation, InstanceId};

/// Progress notifications emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    InstanceCreated {
        instance: InstanceId,
        generation: Generation,
    },
    InstanceInService {
        instance: InstanceId,
        generation: Generation,
    },
    /// An in-service instance was confirmed out of service and will be
    /// replaced.
    InstanceLost {
        instance: InstanceId,
        generation: Generation,
    },
    DeregistrationRequested {
        instance: InstanceId,
    },
    DrainingStarted {
        instance: InstanceId,
        drain_window_secs: u64,
    },
    InstanceTerminated {
        instance: InstanceId,
        drained_ms: u64,
    },
    RolloutConverged {
        generation: Generation,
        instances: u32,
    },
    RolloutStalled {
        reason: String,
    },
    RolloutCancelled {
        generation: Generation,
    },
}

impl RolloutEvent {
    /// The instance this event concerns, if any.
    pub fn instance(&self) -> Option<&str> {
        match self {
            RolloutEvent::InstanceCreated { instance, .. }
            | RolloutEvent::InstanceInService { instance, .. }
            | RolloutEvent::InstanceLost { instance, .. }
            | RolloutEvent::DeregistrationRequested { instance }
            | RolloutEvent::DrainingStarted { instance, .. }
            | RolloutEvent::InstanceTerminated { instance, .. } => Some(instance),
            RolloutEvent::RolloutConverged { .. }
            | RolloutEvent::RolloutStalled { .. }
            | RolloutEvent::RolloutCancelled { .. } => None,
        }
    }
}
