//! Rollout error taxonomy.

use thiserror::Error;

use ebb_core::{InstanceId, PolicyError, TransitionError};

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors raised while driving a rollout.
///
/// Only [`RolloutError::TransientInfra`] and
/// [`RolloutError::HealthCheckTimeout`] are recoverable; they are retried
/// internally and never stall the rollout. Everything else is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RolloutError {
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("health check timed out for instance {0}")]
    HealthCheckTimeout(InstanceId),

    #[error("instance {instance} could not be {stage} after {attempts} attempts")]
    DrainExceeded {
        instance: InstanceId,
        stage: &'static str,
        attempts: u32,
    },

    #[error("surge budget exceeded: {in_flight} new instances in flight, capacity {capacity}")]
    SurgeBudgetExceeded { in_flight: u32, capacity: u32 },

    #[error("instance {instance} not in service after {waited_secs}s")]
    ProgressDeadlineExceeded {
        instance: InstanceId,
        waited_secs: u64,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl RolloutError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RolloutError::TransientInfra(_) | RolloutError::HealthCheckTimeout(_)
        )
    }
}

impl From<PolicyError> for RolloutError {
    fn from(e: PolicyError) -> Self {
        RolloutError::InvalidPolicy(e.to_string())
    }
}

impl From<TransitionError> for RolloutError {
    fn from(e: TransitionError) -> Self {
        RolloutError::InvariantViolation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebb_core::LifecycleState;

    #[test]
    fn only_transient_errors_are_recoverable() {
        assert!(!RolloutError::TransientInfra("create failed".into()).is_fatal());
        assert!(!RolloutError::HealthCheckTimeout("a".into()).is_fatal());
        assert!(RolloutError::InvariantViolation("x".into()).is_fatal());
        assert!(
            RolloutError::DrainExceeded {
                instance: "a".into(),
                stage: "stopped",
                attempts: 3
            }
            .is_fatal()
        );
    }

    #[test]
    fn policy_errors_convert() {
        let err: RolloutError = PolicyError::Invalid("replicas must be at least 1".into()).into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("replicas"));
    }

    #[test]
    fn backward_transition_is_an_invariant_violation() {
        let err: RolloutError = TransitionError {
            id: "a".into(),
            from: LifecycleState::Draining,
            to: LifecycleState::InService,
        }
        .into();
        assert!(matches!(err, RolloutError::InvariantViolation(_)));
        assert!(err.to_string().contains("Draining"));
    }
}
