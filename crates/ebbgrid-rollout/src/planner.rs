//! Rollout planner — surge-based rolling replacement.
//!
//! Given the inventory and a [`RolloutPlan`], computes the next bounded
//! batch of actions. Planning is a pure function of observed state: the
//! batch never depends on what earlier cycles dispatched, only on what
//! the inventory now shows.
//!
//! ```text
//! surge       = ceil(desired × max_surge)
//! creatable   = min(surge − in_flight_new, desired − ready_new − in_flight_new)
//! terminable  = min(ready_new − (desired − available_old), available_old)
//! ```
//!
//! `terminable` is what keeps capacity at the desired count: an old
//! instance is only retired once a new one is in service to take its place.

use ebb_core::{Generation, Instance, InstanceId, Inventory, LifecycleState, RolloutPlan};
use serde::Serialize;
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// One planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Create an instance of the desired generation.
    CreateInstance { generation: Generation },
    /// Start the drain protocol on a retiring instance.
    BeginTermination { instance: InstanceId },
}

/// Inventory counts the planner works from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Desired-generation instances in service, not marked for termination.
    pub ready_new: u32,
    /// Desired-generation instances created but not yet in service.
    pub in_flight_new: u32,
    /// Retiring instances in service, not marked for termination.
    pub available_old: u32,
    /// Retiring instances that are live but carry no traffic.
    pub idle_old: u32,
    /// Instances of any generation between deregistration and stop.
    pub terminating: u32,
}

impl Counts {
    pub fn observe(inventory: &Inventory, desired: &Generation) -> Self {
        let mut c = Counts::default();
        for inst in inventory.iter() {
            let is_new = &inst.generation == desired;
            let marked = inst.is_marked_for_termination();
            match inst.state {
                LifecycleState::Terminated => {}
                s if s.is_terminating() || marked => c.terminating += 1,
                LifecycleState::InService if is_new => c.ready_new += 1,
                LifecycleState::InService => c.available_old += 1,
                _ if is_new => c.in_flight_new += 1,
                _ => c.idle_old += 1,
            }
        }
        c
    }
}

/// Compute the next batch of actions.
///
/// Returns an empty batch when the rollout is converged.
pub fn next_batch(inventory: &Inventory, plan: &RolloutPlan) -> RolloutResult<Vec<Action>> {
    let retiring = inventory.retiring_generations(&plan.generation);
    if retiring.len() > 1 {
        return Err(RolloutError::InvariantViolation(format!(
            "more than one retiring generation has live instances: {}",
            retiring
                .iter()
                .map(Generation::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let counts = Counts::observe(inventory, &plan.generation);
    let surge = plan.surge_capacity();

    // In-flight instances above the surge (adopted after a restart, say)
    // only hold creation back; they are not an error.
    let creatable = surge
        .saturating_sub(counts.in_flight_new)
        .min(plan.desired.saturating_sub(counts.ready_new + counts.in_flight_new));

    let terminable = (counts.ready_new + counts.available_old)
        .saturating_sub(plan.desired)
        .min(counts.available_old);

    let mut batch = Vec::with_capacity((creatable + terminable + counts.idle_old) as usize);

    for _ in 0..creatable {
        batch.push(Action::CreateInstance {
            generation: plan.generation.clone(),
        });
    }

    // Idle retiring instances carry no traffic; retiring them costs nothing.
    let mut idle: Vec<&Instance> = inventory
        .iter()
        .filter(|i| is_retiring(i, &plan.generation) && i.state < LifecycleState::InService)
        .collect();
    idle.sort_by(|a, b| oldest_first(a, b));

    let mut eligible: Vec<&Instance> = inventory
        .iter()
        .filter(|i| is_retiring(i, &plan.generation) && i.state == LifecycleState::InService)
        .collect();
    eligible.sort_by(|a, b| oldest_first(a, b));

    for inst in idle.into_iter().chain(eligible.into_iter().take(terminable as usize)) {
        batch.push(Action::BeginTermination {
            instance: inst.id.clone(),
        });
    }

    debug!(
        generation = %plan.generation,
        ready_new = counts.ready_new,
        in_flight_new = counts.in_flight_new,
        available_old = counts.available_old,
        creatable,
        terminable,
        "planned batch"
    );

    Ok(batch)
}

/// Desired generation fully deployed and every other generation gone.
pub fn is_converged(inventory: &Inventory, plan: &RolloutPlan) -> bool {
    let counts = Counts::observe(inventory, &plan.generation);
    counts.in_flight_new == 0
        && counts.available_old == 0
        && counts.idle_old == 0
        && counts.terminating == 0
        && counts.ready_new >= plan.desired
}

/// Check a batch against the surge and capacity budgets before dispatch.
pub fn check_batch(
    inventory: &Inventory,
    plan: &RolloutPlan,
    batch: &[Action],
) -> RolloutResult<()> {
    let counts = Counts::observe(inventory, &plan.generation);
    let creates = batch
        .iter()
        .filter(|a| matches!(a, Action::CreateInstance { .. }))
        .count() as u32;

    let surge = plan.surge_capacity();
    if creates > 0 && counts.in_flight_new + creates > surge {
        return Err(RolloutError::SurgeBudgetExceeded {
            in_flight: counts.in_flight_new + creates,
            capacity: surge,
        });
    }

    let retiring_in_service = batch
        .iter()
        .filter(|a| match a {
            Action::BeginTermination { instance } => inventory
                .get(instance)
                .is_some_and(|i| {
                    i.state == LifecycleState::InService && !i.is_marked_for_termination()
                }),
            Action::CreateInstance { .. } => false,
        })
        .count() as u32;

    let available = inventory.available();
    let floor = available.min(plan.desired);
    if available - retiring_in_service.min(available) < floor {
        return Err(RolloutError::InvariantViolation(format!(
            "batch retires {retiring_in_service} in-service instances, leaving {} below {floor}",
            available.saturating_sub(retiring_in_service)
        )));
    }

    for action in batch {
        if let Action::BeginTermination { instance } = action {
            match inventory.get(instance) {
                Some(i) if i.is_marked_for_termination() => {
                    return Err(RolloutError::InvariantViolation(format!(
                        "instance {instance} is already terminating"
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(RolloutError::InvariantViolation(format!(
                        "instance {instance} is not in the inventory"
                    )));
                }
            }
        }
    }

    Ok(())
}

fn is_retiring(inst: &Instance, desired: &Generation) -> bool {
    &inst.generation != desired && inst.state.is_live() && !inst.is_marked_for_termination()
}

fn oldest_first(a: &Instance, b: &Instance) -> std::cmp::Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}
