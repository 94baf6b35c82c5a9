//! Error types for policy loading and instance bookkeeping.

use thiserror::Error;

use crate::types::{InstanceId, LifecycleState};

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors raised while loading or validating a rollout policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid max_surge: {0}")]
    InvalidSurge(String),

    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// A lifecycle transition that would move an instance backwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("instance {id}: illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub id: InstanceId,
    pub from: LifecycleState,
    pub to: LifecycleState,
}
