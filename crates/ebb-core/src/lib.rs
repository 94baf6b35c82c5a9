//! ebb-core — shared domain types and policy parsing for ebbgrid.
//!
//! Everything the planner, sequencer, and coordinator agree on lives here:
//! instances and their lifecycle, generations, the per-cycle
//! [`RolloutPlan`], and the TOML rollout policy that produces it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    parse_duration, DrainTrigger, GenerationSpec, HealthTiming, RolloutPolicy, TerminationPolicy,
};
pub use error::{PolicyError, PolicyResult};
pub use types::*;
