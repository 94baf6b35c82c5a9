//! Domain types for rollouts.
//!
//! An [`Instance`] is one backend replica. Instances are grouped into
//! [`Generation`]s and move through a strictly forward [`LifecycleState`].
//! The [`Inventory`] is the coordinator's view of every instance it owns.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::error::TransitionError;

/// Unique identifier for a backend instance.
pub type InstanceId = String;

// ── Generation ────────────────────────────────────────────────────

/// Version label for instances created from the same deployment spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle of an instance. Variants are declared in transition order;
/// an instance may only move to a later variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, process not yet ready.
    Provisioning,
    /// Process ready, load balancer has not confirmed the target yet.
    Ready,
    /// Registered and receiving traffic from the load balancer.
    InService,
    /// Deregistration requested; the process keeps running.
    DeregisterRequested,
    /// Drain timer running; established connections still served.
    Draining,
    /// Stopped.
    Terminated,
}

impl LifecycleState {
    /// Provisioning, Ready or InService.
    pub fn is_live(self) -> bool {
        self <= LifecycleState::InService
    }

    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            LifecycleState::DeregisterRequested | LifecycleState::Draining
        )
    }

    /// Whether the instance still serves traffic, new or established.
    pub fn is_serving(self) -> bool {
        matches!(
            self,
            LifecycleState::InService
                | LifecycleState::DeregisterRequested
                | LifecycleState::Draining
        )
    }
}

/// The load balancer's view of a target. Read-only for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRegistration {
    Unregistered,
    Registering,
    InService,
    Deregistering,
}

impl TargetRegistration {
    /// Whether the load balancer routes new connections to the target.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            TargetRegistration::Registering | TargetRegistration::InService
        )
    }

    pub fn is_in_service(self) -> bool {
        self == TargetRegistration::InService
    }
}

/// Outcome of one bounded poll against a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Yes,
    No,
    /// The collaborator failed or did not answer in time.
    Unknown,
}

// ── Instance ──────────────────────────────────────────────────────

/// One backend replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub generation: Generation,
    pub state: LifecycleState,
    /// Unix timestamp (milliseconds) when the instance was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) when termination was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_requested_at: Option<u64>,
}

impl Instance {
    /// A freshly created instance.
    pub fn new(id: impl Into<InstanceId>, generation: Generation, created_at: u64) -> Self {
        Self {
            id: id.into(),
            generation,
            state: LifecycleState::Provisioning,
            created_at,
            termination_requested_at: None,
        }
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    pub fn advance(&mut self, next: LifecycleState) -> Result<(), TransitionError> {
        if next < self.state {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Marked for retirement (whether or not deregistration went through yet).
    pub fn is_marked_for_termination(&self) -> bool {
        self.termination_requested_at.is_some() || self.state > LifecycleState::InService
    }
}

// ── Rollout plan ──────────────────────────────────────────────────

/// Surge budget: how many new instances may be in flight above the
/// desired count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxSurge {
    /// Fraction of the desired count, rounded up.
    Fraction(f64),
    Absolute(u32),
}

impl MaxSurge {
    /// Surge capacity for `desired` replicas.
    pub fn capacity(&self, desired: u32) -> u32 {
        match *self {
            // The epsilon keeps 10 × 0.3 at 3 instead of 4.
            MaxSurge::Fraction(f) => ((desired as f64 * f) - 1e-9).ceil().max(0.0) as u32,
            MaxSurge::Absolute(n) => n,
        }
    }
}

/// Immutable per-cycle snapshot of the rollout policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPlan {
    pub desired: u32,
    pub max_surge: MaxSurge,
    /// Always zero: no voluntary capacity loss.
    pub max_unavailable: u32,
    pub drain_window: Duration,
    /// The generation being rolled out.
    pub generation: Generation,
}

impl RolloutPlan {
    pub fn surge_capacity(&self) -> u32 {
        self.max_surge.capacity(self.desired)
    }
}

// ── Inventory ─────────────────────────────────────────────────────

/// Every instance known to the coordinator, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Instance>", into = "Vec<Instance>")]
pub struct Inventory {
    instances: BTreeMap<InstanceId, Instance>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: Instance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances of `generation` matching `pred`.
    pub fn count_where(
        &self,
        generation: &Generation,
        pred: impl Fn(&Instance) -> bool,
    ) -> u32 {
        self.instances
            .values()
            .filter(|i| &i.generation == generation && pred(i))
            .count() as u32
    }

    /// In-service instances, any generation, not marked for termination.
    pub fn available(&self) -> u32 {
        self.instances
            .values()
            .filter(|i| i.state == LifecycleState::InService && !i.is_marked_for_termination())
            .count() as u32
    }

    /// Generations other than `desired` that still have non-terminated instances.
    pub fn retiring_generations(&self, desired: &Generation) -> Vec<Generation> {
        let mut gens: Vec<Generation> = self
            .instances
            .values()
            .filter(|i| &i.generation != desired && i.state != LifecycleState::Terminated)
            .map(|i| i.generation.clone())
            .collect();
        gens.sort();
        gens.dedup();
        gens
    }
}

impl From<Vec<Instance>> for Inventory {
    fn from(list: Vec<Instance>) -> Self {
        let mut inv = Inventory::new();
        for inst in list {
            inv.insert(inst);
        }
        inv
    }
}

impl From<Inventory> for Vec<Instance> {
    fn from(inv: Inventory) -> Self {
        inv.instances.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(id: &str, generation: &str, state: LifecycleState) -> Instance {
        Instance {
            state,
            ..Instance::new(id, Generation::new(generation), 1000)
        }
    }

    #[test]
    fn lifecycle_is_ordered() {
        assert!(LifecycleState::Provisioning < LifecycleState::InService);
        assert!(LifecycleState::DeregisterRequested < LifecycleState::Draining);
        assert!(LifecycleState::Draining < LifecycleState::Terminated);
        assert!(LifecycleState::Ready.is_live());
        assert!(!LifecycleState::Draining.is_live());
        assert!(LifecycleState::Draining.is_serving());
        assert!(!LifecycleState::Ready.is_serving());
    }

    #[test]
    fn advance_rejects_backward_transition() {
        let mut i = inst("a", "v1", LifecycleState::Draining);
        let err = i.advance(LifecycleState::InService).unwrap_err();
        assert_eq!(err.from, LifecycleState::Draining);
        assert_eq!(i.state, LifecycleState::Draining);

        assert!(i.advance(LifecycleState::Draining).is_ok());
        assert!(i.advance(LifecycleState::Terminated).is_ok());
        assert_eq!(i.state, LifecycleState::Terminated);
    }

    #[test]
    fn surge_fraction_rounds_up() {
        assert_eq!(MaxSurge::Fraction(0.5).capacity(5), 3);
        assert_eq!(MaxSurge::Fraction(0.25).capacity(4), 1);
        assert_eq!(MaxSurge::Fraction(0.3).capacity(10), 3);
        assert_eq!(MaxSurge::Fraction(1.0).capacity(3), 3);
        assert_eq!(MaxSurge::Absolute(2).capacity(10), 2);
    }

    #[test]
    fn registration_projection() {
        assert!(TargetRegistration::Registering.is_registered());
        assert!(!TargetRegistration::Registering.is_in_service());
        assert!(TargetRegistration::InService.is_in_service());
        assert!(!TargetRegistration::Deregistering.is_registered());
    }

    #[test]
    fn inventory_counts_available_and_retiring() {
        let mut inv = Inventory::new();
        inv.insert(inst("old-1", "v1", LifecycleState::InService));
        inv.insert(inst("old-2", "v1", LifecycleState::Draining));
        inv.insert(inst("new-1", "v2", LifecycleState::InService));
        inv.insert(inst("new-2", "v2", LifecycleState::Ready));

        assert_eq!(inv.available(), 2);
        assert_eq!(
            inv.count_where(&Generation::new("v2"), |i| i.state.is_live()),
            2
        );
        assert_eq!(
            inv.retiring_generations(&Generation::new("v2")),
            vec![Generation::new("v1")]
        );
    }

    #[test]
    fn inventory_serializes_as_list() {
        let mut inv = Inventory::new();
        inv.insert(inst("a", "v1", LifecycleState::InService));
        let json = serde_json::to_string(&inv).unwrap();
        assert!(json.starts_with('['));
        let back: Inventory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inv);
    }
}
