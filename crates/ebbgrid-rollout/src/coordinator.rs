//! Rollout coordinator — the control loop.
//!
//! Each cycle takes a fresh look at the world and acts on it:
//!
//! ```text
//!   list pods ──▶ merge into inventory ──▶ poll readiness / LB health
//!                                               │
//!        ┌──────────────────────────────────────┘
//!        ▼
//!   progress deadline ──▶ plan batch ──▶ check budgets
//!                                               │
//!        ┌──────────────────────────────────────┘
//!        ▼
//!   begin terminations ──▶ advance drains ──▶ dispatch creates ──▶ settle
//! ```
//!
//! The coordinator owns the inventory; collaborators are only ever
//! polled. Calls within a cycle run concurrently but every call is
//! bounded by the poll timeout, so a stuck collaborator delays a cycle
//! by at most that much. A fatal error stops new dispatch while drains
//! already in progress run to completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ebb_core::{
    Generation, Instance, InstanceId, Inventory, LifecycleState, Reading, RolloutPlan,
    RolloutPolicy,
};
use ebbgrid_health::{probe_in_service, ServiceTracker, ServiceVerdict, TargetHealthOracle};
use ebbgrid_pods::{probe_ready, PodLifecycleManager, PodRecord};

use crate::error::{RolloutError, RolloutResult};
use crate::events::RolloutEvent;
use crate::planner::{self, Action, Counts};
use crate::sequencer::{Step, TerminationPhase, TerminationSequencer};

const EVENT_CAPACITY: usize = 1024;

/// Where the rollout as a whole stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    Progressing,
    /// Desired generation fully in service, every other generation stopped.
    Converged,
    /// A fatal error; no new work is started.
    Stalled { reason: String },
    /// Cancellation requested; waiting for in-progress drains.
    Cancelling,
    Cancelled,
}

impl RolloutPhase {
    /// Whether the loop has nothing left to do.
    pub fn is_final(&self) -> bool {
        matches!(self, RolloutPhase::Converged | RolloutPhase::Cancelled)
    }
}

/// How [`RolloutCoordinator::run`] ended, short of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutOutcome {
    Converged,
    Cancelled,
}

/// Point-in-time summary of a rollout.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatus {
    #[serde(flatten)]
    pub phase: RolloutPhase,
    pub generation: Generation,
    pub desired: u32,
    pub available: u32,
    #[serde(flatten)]
    pub counts: Counts,
    /// Sequencers that have not finished yet.
    pub active_drains: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: Vec<InstanceId>,
    pub terminations_started: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
    /// Available instances once the cycle's observations were merged.
    pub available_before: u32,
    pub available_after: u32,
}

/// Result of polling one live instance.
struct Observation {
    id: InstanceId,
    ready: Option<Reading>,
    in_service: Option<Reading>,
}

/// Drives one rollout to convergence.
pub struct RolloutCoordinator {
    policy: Arc<RolloutPolicy>,
    plan: RolloutPlan,
    pods: Arc<dyn PodLifecycleManager>,
    oracle: Arc<dyn TargetHealthOracle>,
    inventory: Inventory,
    sequencers: HashMap<InstanceId, TerminationSequencer>,
    trackers: HashMap<InstanceId, ServiceTracker>,
    /// When each desired-generation instance was first observed.
    first_seen: HashMap<InstanceId, Instant>,
    /// Every id that ever appeared in a pod listing.
    listed: HashSet<InstanceId>,
    /// Confirmed out of service, awaiting replacement.
    lost: HashSet<InstanceId>,
    /// Adopted instances of a retiring generation that have been neither
    /// seen in service nor confirmed out. They are never retired as idle.
    unsettled: HashSet<InstanceId>,
    phase: RolloutPhase,
    fatal: Option<RolloutError>,
    events: broadcast::Sender<RolloutEvent>,
}

impl RolloutCoordinator {
    /// Build a coordinator. The policy is validated first.
    pub fn new(
        policy: RolloutPolicy,
        pods: Arc<dyn PodLifecycleManager>,
        oracle: Arc<dyn TargetHealthOracle>,
    ) -> RolloutResult<Self> {
        policy.validate()?;
        let plan = policy.plan();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            policy: Arc::new(policy),
            plan,
            pods,
            oracle,
            inventory: Inventory::new(),
            sequencers: HashMap::new(),
            trackers: HashMap::new(),
            first_seen: HashMap::new(),
            listed: HashSet::new(),
            lost: HashSet::new(),
            unsettled: HashSet::new(),
            phase: RolloutPhase::Progressing,
            fatal: None,
            events,
        })
    }

    /// Receive progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> &RolloutPhase {
        &self.phase
    }

    pub fn plan(&self) -> &RolloutPlan {
        &self.plan
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// The error that stalled the rollout, if any.
    pub fn fatal_error(&self) -> Option<&RolloutError> {
        self.fatal.as_ref()
    }

    pub fn sequencer(&self, id: &str) -> Option<&TerminationSequencer> {
        self.sequencers.get(id)
    }

    pub fn has_active_drains(&self) -> bool {
        self.sequencers.values().any(|s| !s.is_finished())
    }

    pub fn status(&self) -> RolloutStatus {
        RolloutStatus {
            phase: self.phase.clone(),
            generation: self.plan.generation.clone(),
            desired: self.plan.desired,
            available: self.inventory.available(),
            counts: Counts::observe(&self.inventory, &self.plan.generation),
            active_drains: self.sequencers.values().filter(|s| !s.is_finished()).count(),
        }
    }

    /// Stop creating and retiring instances. Drains already under way
    /// finish; nothing is rolled back.
    pub fn cancel(&mut self) {
        if self.phase == RolloutPhase::Progressing {
            info!(generation = %self.plan.generation, "rollout cancellation requested");
            self.phase = RolloutPhase::Cancelling;
        }
    }

    /// Run cycles every poll interval until the rollout converges, is
    /// cancelled through `shutdown`, or stalls.
    ///
    /// A stall is returned as an error only after in-progress drains
    /// have finished.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> RolloutResult<RolloutOutcome> {
        let interval = self.policy.health.poll_interval;
        info!(
            generation = %self.plan.generation,
            desired = self.plan.desired,
            surge = self.plan.surge_capacity(),
            drain_window_secs = self.plan.drain_window.as_secs(),
            "rollout started"
        );

        let mut watching = true;
        if *shutdown.borrow() {
            self.cancel();
            watching = false;
        }

        loop {
            self.cycle(Instant::now()).await;

            match &self.phase {
                RolloutPhase::Converged => return Ok(RolloutOutcome::Converged),
                RolloutPhase::Cancelled => return Ok(RolloutOutcome::Cancelled),
                RolloutPhase::Stalled { .. } if !self.has_active_drains() => {
                    return Err(self.fatal.clone().unwrap_or_else(|| {
                        RolloutError::InvariantViolation("stalled without a cause".into())
                    }));
                }
                _ => {}
            }

            if watching {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => match changed {
                        Ok(()) if *shutdown.borrow() => {
                            self.cancel();
                            watching = false;
                        }
                        Ok(()) => {}
                        Err(_) => watching = false,
                    },
                }
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// One reconciliation pass at `now`.
    pub async fn cycle(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        if self.phase.is_final() {
            return report;
        }

        self.refresh(now).await;
        if let Err(e) = self.observe(now).await {
            self.stall(e);
        }

        let mut creates = 0;
        if self.phase == RolloutPhase::Progressing {
            if let Err(e) = self.check_progress_deadline(now) {
                self.stall(e);
            }
        }
        if self.phase == RolloutPhase::Progressing {
            self.retire_lost(now, &mut report);
        }
        report.available_before = self.inventory.available();

        if self.phase == RolloutPhase::Progressing {
            match self.plan_batch() {
                Ok(batch) => {
                    for action in batch {
                        match action {
                            Action::CreateInstance { .. } => creates += 1,
                            Action::BeginTermination { instance } => {
                                self.begin_termination(&instance, now, &mut report);
                            }
                        }
                    }
                }
                Err(e) => self.stall(e),
            }
        }

        // Drains advance before creates go out, so a cycle's retirements
        // are under way before its replacements are requested.
        self.advance_drains(now, &mut report).await;

        if self.phase == RolloutPhase::Progressing && creates > 0 {
            self.dispatch_creates(creates, now, &mut report).await;
        }

        report.available_after = self.inventory.available();
        let floor = report.available_before.min(self.plan.desired);
        if self.phase == RolloutPhase::Progressing && report.available_after < floor {
            self.stall(RolloutError::InvariantViolation(format!(
                "available instances fell from {} to {}",
                report.available_before, report.available_after
            )));
        }
        self.settle();
        report
    }

    // ── Observation ───────────────────────────────────────────────

    async fn refresh(&mut self, now: Instant) {
        let timeout = self.policy.health.poll_timeout;
        match tokio::time::timeout(timeout, self.pods.list()).await {
            Ok(Ok(records)) => self.merge_listing(records, now),
            Ok(Err(e)) => {
                let e = RolloutError::TransientInfra(e.to_string());
                warn!(error = %e, "pod listing failed, keeping the previous inventory");
            }
            Err(_) => warn!("pod listing timed out, keeping the previous inventory"),
        }
    }

    fn merge_listing(&mut self, records: Vec<PodRecord>, now: Instant) {
        let seen: HashSet<InstanceId> = records.iter().map(|r| r.id.clone()).collect();

        for record in records {
            if self.inventory.contains(&record.id) {
                continue;
            }
            debug!(
                instance = %record.id,
                generation = %record.generation,
                "adopting instance from pod listing"
            );
            if record.generation == self.plan.generation {
                self.first_seen.insert(record.id.clone(), now);
            } else {
                self.unsettled.insert(record.id.clone());
            }
            self.inventory
                .insert(Instance::new(record.id, record.generation, record.created_at));
        }

        // Pods that were listed before and are now gone were stopped
        // behind our back. Instances with a sequencer are ours to stop.
        let vanished: Vec<(InstanceId, Generation)> = self
            .inventory
            .iter()
            .filter(|i| {
                i.state != LifecycleState::Terminated
                    && !seen.contains(&i.id)
                    && self.listed.contains(&i.id)
                    && !self.sequencers.contains_key(&i.id)
            })
            .map(|i| (i.id.clone(), i.generation.clone()))
            .collect();

        for (id, generation) in vanished {
            warn!(instance = %id, generation = %generation, "instance disappeared from pod listing");
            if let Some(inst) = self.inventory.get_mut(&id) {
                inst.state = LifecycleState::Terminated;
            }
            self.trackers.remove(&id);
            self.lost.remove(&id);
            self.unsettled.remove(&id);
            self.emit(RolloutEvent::InstanceLost {
                instance: id,
                generation,
            });
        }

        self.listed.extend(seen);
    }

    /// Poll every live, unmarked instance concurrently.
    async fn observe(&mut self, now: Instant) -> RolloutResult<()> {
        let timeout = self.policy.health.poll_timeout;
        let targets: Vec<(InstanceId, LifecycleState, bool)> = self
            .inventory
            .iter()
            .filter(|i| i.state.is_live() && !i.is_marked_for_termination())
            .map(|i| (i.id.clone(), i.state, self.unsettled.contains(&i.id)))
            .collect();

        let mut polls = JoinSet::new();
        for (id, state, unsettled) in targets {
            let pods = Arc::clone(&self.pods);
            let oracle = Arc::clone(&self.oracle);
            polls.spawn(async move {
                let mut obs = Observation {
                    id,
                    ready: None,
                    in_service: None,
                };
                if state == LifecycleState::Provisioning {
                    let ready = probe_ready(pods.as_ref(), &obs.id, timeout).await;
                    obs.ready = Some(ready);
                    if ready != Reading::Yes && !unsettled {
                        return obs;
                    }
                }
                obs.in_service = Some(probe_in_service(oracle.as_ref(), &obs.id, timeout).await);
                obs
            });
        }

        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(obs) => self.apply_observation(obs, now)?,
                Err(e) => error!(error = %e, "health poll task failed"),
            }
        }
        Ok(())
    }

    fn apply_observation(&mut self, obs: Observation, now: Instant) -> RolloutResult<()> {
        if obs.ready == Some(Reading::Unknown) || obs.in_service == Some(Reading::Unknown) {
            let e = RolloutError::HealthCheckTimeout(obs.id.clone());
            debug!(error = %e, "not acting on an unknown reading");
        }

        let recheck = self.policy.health.recheck_interval;
        let Some(inst) = self.inventory.get_mut(&obs.id) else {
            return Ok(());
        };
        if inst.is_marked_for_termination() {
            return Ok(());
        }

        if obs.ready == Some(Reading::Yes) && inst.state == LifecycleState::Provisioning {
            inst.advance(LifecycleState::Ready)?;
            debug!(instance = %inst.id, "instance ready");
        }

        let generation = inst.generation.clone();
        let mut event = None;
        match (inst.state, obs.in_service) {
            (LifecycleState::Ready, Some(Reading::Yes)) => {
                inst.advance(LifecycleState::InService)?;
                self.unsettled.remove(&obs.id);
                self.trackers
                    .insert(obs.id.clone(), ServiceTracker::new(recheck));
                event = Some(RolloutEvent::InstanceInService {
                    instance: obs.id.clone(),
                    generation,
                });
            }
            (LifecycleState::InService, Some(reading)) => {
                let tracker = self
                    .trackers
                    .entry(obs.id.clone())
                    .or_insert_with(|| ServiceTracker::new(recheck));
                if tracker.record(reading, now) == ServiceVerdict::ConfirmedOut
                    && self.lost.insert(obs.id.clone())
                {
                    warn!(
                        instance = %obs.id,
                        misses = tracker.consecutive_misses(),
                        "instance confirmed out of service"
                    );
                    event = Some(RolloutEvent::InstanceLost {
                        instance: obs.id.clone(),
                        generation,
                    });
                }
            }
            // Adopted and not yet in service: presumed serving until the
            // tracker says otherwise.
            (_, Some(reading)) if self.unsettled.contains(&obs.id) => {
                let tracker = self
                    .trackers
                    .entry(obs.id.clone())
                    .or_insert_with(|| ServiceTracker::new(recheck));
                if tracker.record(reading, now) == ServiceVerdict::ConfirmedOut {
                    self.unsettled.remove(&obs.id);
                    info!(
                        instance = %obs.id,
                        generation = %generation,
                        "adopted instance confirmed out of service"
                    );
                }
            }
            _ => {}
        }

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    fn check_progress_deadline(&self, now: Instant) -> RolloutResult<()> {
        let deadline = self.policy.progress_deadline;
        for inst in self.inventory.iter() {
            if inst.generation != self.plan.generation
                || inst.state >= LifecycleState::InService
                || inst.is_marked_for_termination()
            {
                continue;
            }
            let Some(seen) = self.first_seen.get(&inst.id) else {
                continue;
            };
            let waited = now.saturating_duration_since(*seen);
            if waited >= deadline {
                return Err(RolloutError::ProgressDeadlineExceeded {
                    instance: inst.id.clone(),
                    waited_secs: waited.as_secs(),
                });
            }
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn plan_batch(&self) -> RolloutResult<Vec<Action>> {
        let mut batch = planner::next_batch(&self.inventory, &self.plan)?;
        batch.retain(|action| match action {
            Action::BeginTermination { instance } => !self.unsettled.contains(instance),
            Action::CreateInstance { .. } => true,
        });
        planner::check_batch(&self.inventory, &self.plan, &batch)?;
        Ok(batch)
    }

    /// Lost instances are retired through the drain protocol like any
    /// other; the planner then sees the gap and replaces them.
    fn retire_lost(&mut self, now: Instant, report: &mut CycleReport) {
        let mut lost: Vec<InstanceId> = self.lost.drain().collect();
        lost.sort();
        for id in lost {
            if self
                .inventory
                .get(&id)
                .is_some_and(|i| i.state.is_live() && !i.is_marked_for_termination())
            {
                self.begin_termination(&id, now, report);
            }
        }
    }

    fn begin_termination(&mut self, id: &str, now: Instant, report: &mut CycleReport) {
        if self.sequencers.contains_key(id) {
            return;
        }
        let Some(inst) = self.inventory.get_mut(id) else {
            return;
        };
        inst.termination_requested_at = Some(epoch_millis());
        info!(
            instance = %id,
            generation = %inst.generation,
            "termination started"
        );
        self.sequencers
            .insert(id.to_string(), TerminationSequencer::new(id, now));
        report.terminations_started.push(id.to_string());
    }

    async fn dispatch_creates(&mut self, count: u32, now: Instant, report: &mut CycleReport) {
        let timeout = self.policy.health.poll_timeout;
        let mut creates = JoinSet::new();
        for _ in 0..count {
            let pods = Arc::clone(&self.pods);
            let policy = Arc::clone(&self.policy);
            creates.spawn(async move {
                tokio::time::timeout(timeout, pods.create(&policy.generation)).await
            });
        }

        while let Some(joined) = creates.join_next().await {
            match joined {
                Ok(Ok(Ok(record))) => self.record_created(record, now, report),
                Ok(Ok(Err(e))) => {
                    let e = RolloutError::TransientInfra(e.to_string());
                    warn!(error = %e, "instance creation failed, retrying next cycle");
                }
                // The pod may still appear; the next listing adopts it.
                Ok(Err(_)) => warn!("instance creation timed out"),
                Err(e) => error!(error = %e, "create task failed"),
            }
        }
    }

    fn record_created(&mut self, record: PodRecord, now: Instant, report: &mut CycleReport) {
        if record.generation != self.plan.generation {
            warn!(
                instance = %record.id,
                generation = %record.generation,
                expected = %self.plan.generation,
                "created instance reports an unexpected generation"
            );
        }
        self.first_seen.insert(record.id.clone(), now);
        report.created.push(record.id.clone());
        self.emit(RolloutEvent::InstanceCreated {
            instance: record.id.clone(),
            generation: record.generation.clone(),
        });
        self.inventory
            .insert(Instance::new(record.id, record.generation, record.created_at));
    }

    // ── Drains ────────────────────────────────────────────────────

    async fn advance_drains(&mut self, now: Instant, report: &mut CycleReport) {
        if self.phase != RolloutPhase::Progressing {
            self.withdraw_undrained();
        }

        let active: Vec<InstanceId> = self
            .sequencers
            .iter()
            .filter(|(_, s)| !s.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        let mut drains = JoinSet::new();
        for id in active {
            let Some(mut seq) = self.sequencers.remove(&id) else {
                continue;
            };
            let pods = Arc::clone(&self.pods);
            let oracle = Arc::clone(&self.oracle);
            let policy = Arc::clone(&self.policy);
            drains.spawn(async move {
                let progress = seq
                    .advance(now, pods.as_ref(), oracle.as_ref(), &policy)
                    .await;
                (seq, progress)
            });
        }

        while let Some(joined) = drains.join_next().await {
            let (seq, progress) = match joined {
                Ok(done) => done,
                Err(e) => {
                    self.stall(RolloutError::InvariantViolation(format!(
                        "drain task failed: {e}"
                    )));
                    continue;
                }
            };
            let id = seq.instance_id().to_string();
            self.sequencers.insert(id.clone(), seq);
            for step in progress.steps {
                if let Err(e) = self.apply_step(&id, step, report) {
                    self.stall(e);
                }
            }
            if let Some(e) = progress.fatal {
                self.stall(e);
            }
        }
    }

    /// Once halted, terminations that have not reached the load balancer
    /// are dropped; the instance keeps serving.
    fn withdraw_undrained(&mut self) {
        let pending: Vec<InstanceId> = self
            .sequencers
            .iter()
            .filter(|(_, s)| s.phase() == TerminationPhase::Requested)
            .map(|(id, _)| id.clone())
            .collect();

        for id in pending {
            self.sequencers.remove(&id);
            if let Some(inst) = self.inventory.get_mut(&id) {
                inst.termination_requested_at = None;
            }
            if self
                .trackers
                .get(&id)
                .is_some_and(|t| t.verdict() == ServiceVerdict::ConfirmedOut)
            {
                self.lost.insert(id.clone());
            }
            info!(instance = %id, "termination withdrawn before deregistration");
        }
    }

    fn apply_step(&mut self, id: &str, step: Step, report: &mut CycleReport) -> RolloutResult<()> {
        let (state, event) = match step {
            Step::DeregistrationRequested => (
                LifecycleState::DeregisterRequested,
                RolloutEvent::DeregistrationRequested {
                    instance: id.to_string(),
                },
            ),
            Step::DrainingStarted => (
                LifecycleState::Draining,
                RolloutEvent::DrainingStarted {
                    instance: id.to_string(),
                    drain_window_secs: self.plan.drain_window.as_secs(),
                },
            ),
            Step::Terminated { drained_for } => {
                self.trackers.remove(id);
                report.terminated.push(id.to_string());
                (
                    LifecycleState::Terminated,
                    RolloutEvent::InstanceTerminated {
                        instance: id.to_string(),
                        drained_ms: drained_for.as_millis() as u64,
                    },
                )
            }
        };

        if let Some(inst) = self.inventory.get_mut(id) {
            inst.advance(state)?;
        }
        self.emit(event);
        Ok(())
    }

    // ── Phase ─────────────────────────────────────────────────────

    fn settle(&mut self) {
        if self.has_active_drains() {
            return;
        }
        match self.phase {
            RolloutPhase::Progressing if planner::is_converged(&self.inventory, &self.plan) => {
                self.phase = RolloutPhase::Converged;
                let counts = Counts::observe(&self.inventory, &self.plan.generation);
                info!(
                    generation = %self.plan.generation,
                    instances = counts.ready_new,
                    "rollout converged"
                );
                self.emit(RolloutEvent::RolloutConverged {
                    generation: self.plan.generation.clone(),
                    instances: counts.ready_new,
                });
            }
            RolloutPhase::Cancelling => {
                self.phase = RolloutPhase::Cancelled;
                info!(generation = %self.plan.generation, "rollout cancelled");
                self.emit(RolloutEvent::RolloutCancelled {
                    generation: self.plan.generation.clone(),
                });
            }
            _ => {}
        }
    }

    fn stall(&mut self, e: RolloutError) {
        if let RolloutPhase::Stalled { .. } = self.phase {
            error!(error = %e, "further error while stalled");
            return;
        }
        error!(error = %e, fatal = e.is_fatal(), "rollout stalled");
        self.phase = RolloutPhase::Stalled {
            reason: e.to_string(),
        };
        self.emit(RolloutEvent::RolloutStalled {
            reason: e.to_string(),
        });
        self.fatal = Some(e);
    }

    fn emit(&self, event: RolloutEvent) {
        debug!(?event, "rollout event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
