//! Termination sequencer — the drain protocol for one retiring instance.
//!
//! ```text
//! Requested ──deregistration accepted──▶ DeregisterRequested
//!     DeregisterRequested ──LB ack (or ack timeout)──▶ Draining
//!         Draining ──drain window elapsed, stop ok──▶ Terminated
//! ```
//!
//! The stop at the end of the drain window is unconditional: connections
//! still open at that point are cut, which bounds the worst-case session
//! lifetime. Failed deregistration requests and failed stops are retried
//! with backoff; exhausting the attempt ceiling is fatal.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use ebb_core::{DrainTrigger, InstanceId, Reading, RolloutPolicy};
use ebbgrid_health::{probe_registered, TargetHealthOracle};
use ebbgrid_pods::PodLifecycleManager;

use crate::error::RolloutError;

/// Where a sequencer is in the drain protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TerminationPhase {
    /// Termination decided, deregistration not yet accepted.
    Requested,
    DeregisterRequested,
    Draining,
    Terminated,
    /// Retries exhausted. The instance is left running.
    Failed,
}

/// A transition taken by [`TerminationSequencer::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DeregistrationRequested,
    DrainingStarted,
    Terminated { drained_for: Duration },
}

/// Outcome of one `advance` call.
#[derive(Debug, Default)]
pub struct Progress {
    pub steps: Vec<Step>,
    /// Set when retries ran out; the rollout must stall.
    pub fatal: Option<RolloutError>,
}

/// Drives one instance from termination request to stop.
#[derive(Debug, Clone)]
pub struct TerminationSequencer {
    instance_id: InstanceId,
    phase: TerminationPhase,
    requested_at: Instant,
    deregistered_at: Option<Instant>,
    draining_since: Option<Instant>,
    terminated_at: Option<Instant>,
    /// Failed attempts at the current step.
    attempts: u32,
    retry_at: Option<Instant>,
}

impl TerminationSequencer {
    pub fn new(instance_id: impl Into<InstanceId>, now: Instant) -> Self {
        Self {
            instance_id: instance_id.into(),
            phase: TerminationPhase::Requested,
            requested_at: now,
            deregistered_at: None,
            draining_since: None,
            terminated_at: None,
            attempts: 0,
            retry_at: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn phase(&self) -> TerminationPhase {
        self.phase
    }

    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    pub fn draining_since(&self) -> Option<Instant> {
        self.draining_since
    }

    /// Time spent draining, once terminated.
    pub fn drained_for(&self) -> Option<Duration> {
        Some(self.terminated_at?.saturating_duration_since(self.draining_since?))
    }

    /// Terminated or failed.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            TerminationPhase::Terminated | TerminationPhase::Failed
        )
    }

    /// Take every transition that is due at `now`.
    pub async fn advance(
        &mut self,
        now: Instant,
        pods: &dyn PodLifecycleManager,
        oracle: &dyn TargetHealthOracle,
        policy: &RolloutPolicy,
    ) -> Progress {
        let mut progress = Progress::default();
        loop {
            match self.step(now, pods, oracle, policy).await {
                Ok(Some(step)) => progress.steps.push(step),
                Ok(None) => break,
                Err(e) => {
                    progress.fatal = Some(e);
                    break;
                }
            }
        }
        progress
    }

    async fn step(
        &mut self,
        now: Instant,
        pods: &dyn PodLifecycleManager,
        oracle: &dyn TargetHealthOracle,
        policy: &RolloutPolicy,
    ) -> Result<Option<Step>, RolloutError> {
        let timeout = policy.health.poll_timeout;
        let id = self.instance_id.as_str();

        match self.phase {
            TerminationPhase::Requested => {
                if self.retry_pending(now) {
                    return Ok(None);
                }
                let result =
                    tokio::time::timeout(timeout, oracle.request_deregistration(id)).await;
                match flatten(result) {
                    Ok(()) => {
                        debug!(instance = %id, "deregistration requested");
                        self.phase = TerminationPhase::DeregisterRequested;
                        self.deregistered_at = Some(now);
                        self.reset_retries();
                        Ok(Some(Step::DeregistrationRequested))
                    }
                    Err(reason) => self.record_failure(now, policy, "deregistered", &reason),
                }
            }

            TerminationPhase::DeregisterRequested => {
                let start = match policy.drain_trigger {
                    DrainTrigger::Immediate => true,
                    DrainTrigger::Acknowledged => {
                        let waited = self
                            .deregistered_at
                            .map(|t| now.saturating_duration_since(t))
                            .unwrap_or_default();
                        match probe_registered(oracle, id, timeout).await {
                            Reading::No => true,
                            _ if waited >= policy.deregister_ack_timeout => {
                                warn!(
                                    instance = %id,
                                    waited_secs = waited.as_secs(),
                                    "no deregistration ack from load balancer, draining anyway"
                                );
                                true
                            }
                            _ => false,
                        }
                    }
                };
                if !start {
                    return Ok(None);
                }
                self.phase = TerminationPhase::Draining;
                self.draining_since = Some(now);
                debug!(
                    instance = %id,
                    drain_window_secs = policy.drain_window.as_secs(),
                    "draining started"
                );
                Ok(Some(Step::DrainingStarted))
            }

            TerminationPhase::Draining => {
                let since = self.draining_since.unwrap_or(now);
                if now.saturating_duration_since(since) < policy.drain_window
                    || self.retry_pending(now)
                {
                    return Ok(None);
                }
                let result = tokio::time::timeout(timeout, pods.stop(id)).await;
                match flatten(result) {
                    Ok(()) => {
                        self.phase = TerminationPhase::Terminated;
                        self.terminated_at = Some(now);
                        let drained_for = now.saturating_duration_since(since);
                        debug!(
                            instance = %id,
                            drained_secs = drained_for.as_secs(),
                            "instance terminated"
                        );
                        Ok(Some(Step::Terminated { drained_for }))
                    }
                    Err(reason) => self.record_failure(now, policy, "stopped", &reason),
                }
            }

            TerminationPhase::Terminated | TerminationPhase::Failed => Ok(None),
        }
    }

    fn retry_pending(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|t| now < t)
    }

    fn reset_retries(&mut self) {
        self.attempts = 0;
        self.retry_at = None;
    }

    fn record_failure(
        &mut self,
        now: Instant,
        policy: &RolloutPolicy,
        stage: &'static str,
        reason: &str,
    ) -> Result<Option<Step>, RolloutError> {
        self.attempts += 1;
        let ceiling = policy.termination.max_stop_attempts;

        if self.attempts >= ceiling {
            self.phase = TerminationPhase::Failed;
            warn!(
                instance = %self.instance_id,
                attempts = self.attempts,
                error = %reason,
                "instance could not be {stage}, giving up"
            );
            return Err(RolloutError::DrainExceeded {
                instance: self.instance_id.clone(),
                stage,
                attempts: self.attempts,
            });
        }

        let backoff = policy.termination.backoff(self.attempts);
        self.retry_at = Some(now + backoff);
        debug!(
            instance = %self.instance_id,
            attempt = self.attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %reason,
            "instance could not be {stage}, retrying"
        );
        Ok(None)
    }
}

fn flatten(
    result: Result<anyhow::Result<()>, tokio::time::error::Elapsed>,
) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}
