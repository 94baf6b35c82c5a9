//! ebbgrid-health — the load balancer's view of rollout targets.
//!
//! The coordinator never owns target registration; it polls it through
//! the [`TargetHealthOracle`] trait. Every poll is time-bounded, and a
//! timed-out or failed poll reads as [`Reading::Unknown`], which is never
//! acted upon.
//!
//! # Architecture
//!
//! ```text
//! TargetHealthOracle (trait)
//!   ├── HttpTargetOracle — LB controller target-health endpoint over hyper
//!   └── (simulated cluster in ebbgrid-sim)
//!
//! ServiceTracker — per-instance stale-read guard
//!   single "not in service" reading → Suspect
//!   re-confirmed after recheck_interval → ConfirmedOut
//! ```

pub mod endpoint;
pub mod oracle;
pub mod tracker;

pub use endpoint::HttpTargetOracle;
pub use ebb_core::Reading;
pub use oracle::{probe_in_service, probe_registered, TargetHealthOracle};
pub use tracker::{ServiceTracker, ServiceVerdict};
