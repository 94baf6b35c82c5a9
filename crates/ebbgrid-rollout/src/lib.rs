//! ebbgrid rollouts — replace a fleet without dropping a session.
//!
//! A rollout swaps every instance of a backend fleet for one of a new
//! generation while keeping the in-service count at the desired level and
//! giving every retiring instance a full drain window before it is
//! stopped.
//!
//! # Components
//!
//! - **`planner`** — surge arithmetic: which instances to create and which
//!   to retire next, as a pure function of the inventory
//! - **`sequencer`** — the per-instance drain protocol (deregister, wait
//!   for the load balancer, drain, stop)
//! - **`coordinator`** — the control loop tying both to the pod manager
//!   and the load balancer
//! - **`events`** — progress notifications for observers

pub mod coordinator;
pub mod error;
pub mod events;
pub mod planner;
pub mod sequencer;

pub use coordinator::{
    CycleReport, RolloutCoordinator, RolloutOutcome, RolloutPhase, RolloutStatus,
};
pub use error::{RolloutError, RolloutResult};
pub use events::RolloutEvent;
pub use planner::{Action, Counts, check_batch, is_converged, next_batch};
pub use sequencer::{Progress, Step, TerminationPhase, TerminationSequencer};
