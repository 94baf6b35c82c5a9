//! End-to-end rollouts against the simulated cluster.
//!
//! Every cycle is driven with an explicit `Instant`, five seconds apart,
//! so drain windows of minutes run in microseconds of wall time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};

use ebb_core::{Generation, GenerationSpec, LifecycleState, MaxSurge, RolloutPolicy};
use ebbgrid_health::TargetHealthOracle;
use ebbgrid_rollout::{
    CycleReport, RolloutCoordinator, RolloutError, RolloutEvent, RolloutOutcome, RolloutPhase,
    TerminationPhase,
};
use ebbgrid_pods::PodLifecycleManager;
use ebbgrid_sim::SimCluster;

const CYCLE: Duration = Duration::from_secs(5);

fn spec() -> GenerationSpec {
    GenerationSpec {
        name: "chat".into(),
        image: "chat:v2".into(),
        env: Default::default(),
    }
}

fn policy(desired: u32, surge: f64) -> RolloutPolicy {
    let mut p = RolloutPolicy::new(
        desired,
        MaxSurge::Fraction(surge),
        Duration::from_secs(180),
        spec(),
    );
    p.lb_deregistration_delay = Duration::from_secs(120);
    p
}

fn seed_old(sim: &SimCluster, n: u64) -> Vec<String> {
    (0..n).map(|i| sim.seed_in_service("v1", 1_000 + i)).collect()
}

fn coordinator(sim: &SimCluster, policy: RolloutPolicy) -> RolloutCoordinator {
    RolloutCoordinator::new(policy, Arc::new(sim.clone()), Arc::new(sim.clone())).unwrap()
}

fn drain_events(rx: &mut broadcast::Receiver<RolloutEvent>) -> Vec<RolloutEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Cycle until the rollout is final or stalled with nothing draining.
async fn drive(
    coord: &mut RolloutCoordinator,
    start: Instant,
    max_cycles: u32,
) -> (Instant, Vec<CycleReport>) {
    let mut now = start;
    let mut reports = Vec::new();
    for _ in 0..max_cycles {
        reports.push(coord.cycle(now).await);
        let stalled = matches!(coord.phase(), RolloutPhase::Stalled { .. });
        if coord.phase().is_final() || (stalled && !coord.has_active_drains()) {
            break;
        }
        now += CYCLE;
    }
    (now, reports)
}

// ── Surge, capacity floor, drain window ───────────────────────────

#[tokio::test]
async fn rolls_five_instances_without_losing_capacity() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 5);
    let p = policy(5, 0.5);
    let new_gen = p.generation.generation();
    let mut coord = coordinator(&sim, p);
    let mut rx = coord.subscribe();

    let mut now = Instant::now();
    let mut last_state: HashMap<String, LifecycleState> = HashMap::new();
    for _ in 0..100 {
        let report = coord.cycle(now).await;
        assert!(report.available_before >= 5, "{report:?}");
        assert!(report.available_after >= 5, "{report:?}");
        assert!(coord.status().counts.in_flight_new <= 3);

        // Lifecycle states never move backwards.
        for inst in coord.inventory().iter() {
            if let Some(prev) = last_state.insert(inst.id.clone(), inst.state) {
                assert!(inst.state >= prev, "{} went from {prev:?} to {:?}", inst.id, inst.state);
            }
        }

        if coord.phase().is_final() {
            break;
        }
        now += CYCLE;
    }
    assert_eq!(coord.phase(), &RolloutPhase::Converged);

    let events = drain_events(&mut rx);
    let first_deregistration = events
        .iter()
        .position(|e| matches!(e, RolloutEvent::DeregistrationRequested { .. }))
        .expect("old instances were deregistered");
    let created_before = events[..first_deregistration]
        .iter()
        .filter(|e| matches!(e, RolloutEvent::InstanceCreated { .. }))
        .count();
    assert!(created_before <= 3, "created {created_before} before any deregistration");

    for event in &events {
        if let RolloutEvent::InstanceTerminated { drained_ms, .. } = event {
            assert!(*drained_ms >= 120_000, "drained only {drained_ms}ms");
            assert!(*drained_ms <= 180_000 + CYCLE.as_millis() as u64);
        }
    }
    assert!(matches!(
        events.last(),
        Some(RolloutEvent::RolloutConverged { instances: 5, .. })
    ));

    assert_eq!(sim.creates(), 5);
    assert!(sim.running(&Generation::new("v1")).is_empty());
    assert_eq!(sim.running(&new_gen).len(), 5);
    for id in &old {
        assert!(!sim.is_running(id));
        assert_eq!(
            coord.inventory().get(id).map(|i| i.state),
            Some(LifecycleState::Terminated)
        );
    }
}

#[tokio::test]
async fn old_instances_keep_running_through_the_drain_window() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    let mut coord = coordinator(&sim, policy(2, 0.5));
    let t0 = Instant::now();

    coord.cycle(t0).await;
    let report = coord.cycle(t0 + CYCLE).await;
    assert_eq!(report.terminations_started, vec![old[0].clone()]);
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::Draining)
    );

    // Just short of the window: still running.
    coord.cycle(t0 + CYCLE + Duration::from_secs(175)).await;
    assert!(sim.is_running(&old[0]));

    let report = coord.cycle(t0 + CYCLE + Duration::from_secs(180)).await;
    assert!(report.terminated.contains(&old[0]));
    assert!(!sim.is_running(&old[0]));
}

// ── A single unhealthy reading is not enough ──────────────────────

#[tokio::test]
async fn single_unhealthy_reading_does_not_retire_an_instance() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    // Hold the rollout in its first phase so nothing is retired by plan.
    sim.fail_creates(u32::MAX);
    sim.script_in_service(&old[0], &[true, false, true]);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let mut rx = coord.subscribe();
    let t0 = Instant::now();

    for i in 0..10 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty());
    }

    assert!(sim.is_running(&old[0]));
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::InService)
    );
    let events = drain_events(&mut rx);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, RolloutEvent::InstanceLost { .. }))
    );
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);
}

#[tokio::test]
async fn confirmed_out_instance_is_drained_and_replaced() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);
    sim.script_in_service(&old[0], &[true, false, false, false]);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let mut rx = coord.subscribe();
    let t0 = Instant::now();

    // Misses at t0+5s and t0+10s: suspect, not yet confirmed.
    for i in 0..3 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty());
    }

    // Third miss, a full recheck interval after the first.
    let report = coord.cycle(t0 + CYCLE * 3).await;
    assert_eq!(report.terminations_started, vec![old[0].clone()]);
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);

    let lost: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RolloutEvent::InstanceLost { .. }))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].instance(), Some(old[0].as_str()));

    // The lost instance still gets its drain before it is stopped.
    assert!(sim.is_running(&old[0]));

    sim.fail_creates(0);
    let report = coord.cycle(t0 + CYCLE * 4).await;
    assert!(!report.created.is_empty());
}

fn state_of(coord: &RolloutCoordinator, id: &str) -> Option<LifecycleState> {
    coord.inventory().get(id).map(|i| i.state)
}

fn lost_events(rx: &mut broadcast::Receiver<RolloutEvent>) -> usize {
    drain_events(rx)
        .iter()
        .filter(|e| matches!(e, RolloutEvent::InstanceLost { .. }))
        .count()
}

#[tokio::test]
async fn adopted_instance_survives_a_stale_first_reading() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);
    sim.script_in_service(&old[0], &[false, true, true]);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let mut rx = coord.subscribe();
    let t0 = Instant::now();

    let report = coord.cycle(t0).await;
    assert!(report.terminations_started.is_empty(), "{report:?}");
    assert_eq!(state_of(&coord, &old[0]), Some(LifecycleState::Ready));

    for i in 1..5 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty(), "{report:?}");
        assert_eq!(report.available_after, 2);
    }
    assert!(sim.is_running(&old[0]));
    assert_eq!(state_of(&coord, &old[0]), Some(LifecycleState::InService));
    assert_eq!(lost_events(&mut rx), 0);
}

#[tokio::test]
async fn adopted_instance_survives_unknown_readings() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);
    sim.fail_in_service(&old[0], 3);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let t0 = Instant::now();

    for i in 0..3 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty(), "{report:?}");
        assert!(
            coord
                .inventory()
                .get(&old[0])
                .is_some_and(|inst| !inst.is_marked_for_termination())
        );
    }

    coord.cycle(t0 + CYCLE * 3).await;
    assert_eq!(state_of(&coord, &old[0]), Some(LifecycleState::InService));
    assert_eq!(coord.status().available, 2);
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);
}

#[tokio::test]
async fn adopted_instance_confirmed_out_is_retired() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);
    sim.script_in_service(&old[0], &[false, false, false]);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let t0 = Instant::now();

    for i in 0..2 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty(), "{report:?}");
    }

    // Third miss, a full recheck interval after the first.
    let report = coord.cycle(t0 + CYCLE * 2).await;
    assert_eq!(report.terminations_started, vec![old[0].clone()]);
    assert_eq!(state_of(&coord, &old[1]), Some(LifecycleState::InService));
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);
}

#[tokio::test]
async fn unknown_readings_do_not_retire_an_in_service_instance() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);

    let mut coord = coordinator(&sim, policy(2, 0.5));
    let mut rx = coord.subscribe();
    let t0 = Instant::now();
    coord.cycle(t0).await;
    assert_eq!(state_of(&coord, &old[0]), Some(LifecycleState::InService));

    sim.fail_in_service(&old[0], 10);
    for i in 1..=10 {
        let report = coord.cycle(t0 + CYCLE * i).await;
        assert!(report.terminations_started.is_empty(), "{report:?}");
        assert_eq!(report.available_after, 2);
    }
    assert_eq!(state_of(&coord, &old[0]), Some(LifecycleState::InService));
    assert_eq!(lost_events(&mut rx), 0);

    // Once creates succeed the rollout proceeds normally.
    sim.fail_creates(0);
    drive(&mut coord, t0 + CYCLE * 11, 100).await;
    assert_eq!(coord.phase(), &RolloutPhase::Converged);
    for id in &old {
        assert!(!sim.is_running(id));
    }
}

// ── Stop keeps failing ────────────────────────────────────────────

#[tokio::test]
async fn exhausted_stop_retries_stall_the_rollout() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 5);
    sim.fail_stop(&old[0], 3);

    let mut coord = coordinator(&sim, policy(5, 0.5));
    let mut rx = coord.subscribe();
    let (now, _) = drive(&mut coord, Instant::now(), 100).await;

    assert!(matches!(coord.phase(), RolloutPhase::Stalled { .. }));
    assert_eq!(
        coord.fatal_error(),
        Some(&RolloutError::DrainExceeded {
            instance: old[0].clone(),
            stage: "stopped",
            attempts: 3,
        })
    );
    assert_eq!(sim.stop_attempts(&old[0]), 3);
    assert!(sim.is_running(&old[0]));

    let events = drain_events(&mut rx);
    let stalled = events
        .iter()
        .filter(|e| matches!(e, RolloutEvent::RolloutStalled { .. }))
        .count();
    assert_eq!(stalled, 1);

    // Nothing new is started once stalled.
    let creates = sim.creates();
    for i in 1..5 {
        let report = coord.cycle(now + CYCLE * i).await;
        assert!(report.created.is_empty());
        assert!(report.terminations_started.is_empty());
    }
    assert_eq!(sim.creates(), creates);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn stall_lets_in_progress_drains_finish() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 3);
    let mut p = policy(3, 1.0);
    p.termination.max_stop_attempts = 1;
    sim.fail_stop(&old[0], 1);

    let mut coord = coordinator(&sim, p);
    drive(&mut coord, Instant::now(), 100).await;

    // old[0] failed its only stop; its batch-mates still drained and stopped.
    assert!(sim.is_running(&old[0]));
    assert!(!sim.is_running(&old[1]));
    assert!(!sim.is_running(&old[2]));
    assert!(!coord.has_active_drains());
}

// ── Protocol details ──────────────────────────────────────────────

#[tokio::test]
async fn replanning_within_a_cycle_does_not_duplicate_work() {
    let sim = SimCluster::new();
    seed_old(&sim, 4);
    sim.block_readiness(true);

    let mut coord = coordinator(&sim, policy(4, 0.5));
    let t0 = Instant::now();

    let first = coord.cycle(t0).await;
    assert_eq!(first.created.len(), 2);

    let again = coord.cycle(t0).await;
    assert!(again.created.is_empty());
    assert!(again.terminations_started.is_empty());

    coord.cycle(t0 + CYCLE).await;
    assert_eq!(sim.creates(), 2);
    assert_eq!(coord.status().counts.in_flight_new, 2);
}

#[tokio::test]
async fn slow_deregistration_ack_delays_drain_start() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 1);
    sim.delay_deregistration_ack(&old[0], true);

    let mut coord = coordinator(&sim, policy(1, 1.0));
    let t0 = Instant::now();
    coord.cycle(t0).await;
    coord.cycle(t0 + CYCLE).await;
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::DeregisterRequested)
    );

    // No ack within the ack timeout: drain anyway.
    coord.cycle(t0 + CYCLE + Duration::from_secs(30)).await;
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::Draining)
    );
}

#[tokio::test]
async fn failed_deregistration_is_retried() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 1);
    sim.fail_deregistration(&old[0], 1);

    let mut coord = coordinator(&sim, policy(1, 1.0));
    let t0 = Instant::now();
    coord.cycle(t0).await;
    coord.cycle(t0 + CYCLE).await;
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::InService)
    );
    assert!(coord.inventory().get(&old[0]).is_some_and(|i| i.is_marked_for_termination()));

    coord.cycle(t0 + CYCLE * 2).await;
    assert_eq!(
        coord.inventory().get(&old[0]).map(|i| i.state),
        Some(LifecycleState::Draining)
    );
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);
}

#[tokio::test]
async fn progress_deadline_stalls_a_stuck_rollout() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.block_readiness(true);

    let mut p = policy(2, 0.5);
    p.progress_deadline = Duration::from_secs(60);
    let mut coord = coordinator(&sim, p);
    let t0 = Instant::now();

    coord.cycle(t0).await;
    coord.cycle(t0 + Duration::from_secs(30)).await;
    assert_eq!(coord.phase(), &RolloutPhase::Progressing);

    coord.cycle(t0 + Duration::from_secs(60)).await;
    assert!(matches!(
        coord.fatal_error(),
        Some(RolloutError::ProgressDeadlineExceeded { waited_secs: 60, .. })
    ));
    // The old fleet is untouched.
    for id in &old {
        assert!(sim.is_running(id));
    }
}

#[tokio::test]
async fn cancel_finishes_drains_without_new_work() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 5);
    let mut coord = coordinator(&sim, policy(5, 0.5));
    let mut rx = coord.subscribe();
    let t0 = Instant::now();

    coord.cycle(t0).await;
    coord.cycle(t0 + CYCLE).await;
    let created = sim.creates();
    coord.cancel();
    assert_eq!(coord.phase(), &RolloutPhase::Cancelling);

    drive(&mut coord, t0 + CYCLE * 2, 100).await;
    assert_eq!(coord.phase(), &RolloutPhase::Cancelled);
    assert_eq!(sim.creates(), created);

    // The first batch drained out; the rest of the old fleet stays up.
    for id in &old[..3] {
        assert!(!sim.is_running(id));
    }
    for id in &old[3..] {
        assert!(sim.is_running(id));
    }
    assert!(matches!(
        drain_events(&mut rx).last(),
        Some(RolloutEvent::RolloutCancelled { .. })
    ));
}

#[tokio::test]
async fn cancel_withdraws_terminations_not_yet_deregistered() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 1);
    sim.fail_deregistration(&old[0], 1);

    let mut coord = coordinator(&sim, policy(1, 1.0));
    let t0 = Instant::now();
    coord.cycle(t0).await;
    let report = coord.cycle(t0 + CYCLE).await;
    assert_eq!(report.terminations_started, vec![old[0].clone()]);
    assert_eq!(
        coord.sequencer(&old[0]).map(|s| s.phase()),
        Some(TerminationPhase::Requested)
    );

    coord.cancel();
    coord.cycle(t0 + CYCLE * 2).await;
    assert_eq!(coord.phase(), &RolloutPhase::Cancelled);
    assert!(coord.sequencer(&old[0]).is_none());

    // Never deregistered, still serving.
    let inst = coord.inventory().get(&old[0]).unwrap();
    assert_eq!(inst.state, LifecycleState::InService);
    assert!(!inst.is_marked_for_termination());
    assert!(sim.is_in_service(&old[0]).await.unwrap());
    assert!(sim.is_running(&old[0]));
}

#[tokio::test]
async fn restarted_coordinator_resumes_from_the_pod_listing() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 5);
    let t0 = Instant::now();

    {
        let mut first = coordinator(&sim, policy(5, 0.5));
        first.cycle(t0).await;
        first.cycle(t0 + CYCLE).await;
        assert_eq!(first.status().active_drains, 3);
    }

    // The second instance of the coordinator knows only what it can list.
    let p = policy(5, 0.5);
    let new_gen = p.generation.generation();
    let mut second = coordinator(&sim, p);
    let mut rx = second.subscribe();
    drive(&mut second, t0 + CYCLE * 2, 100).await;

    assert_eq!(second.phase(), &RolloutPhase::Converged);
    assert_eq!(sim.creates(), 5);
    assert_eq!(sim.running(&new_gen).len(), 5);
    for id in &old {
        assert!(!sim.is_running(id));
    }
    for event in drain_events(&mut rx) {
        if let RolloutEvent::InstanceTerminated { drained_ms, .. } = event {
            assert!(drained_ms >= 120_000);
        }
    }
}

#[tokio::test]
async fn vanished_pods_are_replaced() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.fail_creates(u32::MAX);
    let p = policy(2, 0.5);
    let new_gen = p.generation.generation();
    let mut coord = coordinator(&sim, p);
    let mut rx = coord.subscribe();
    let t0 = Instant::now();

    coord.cycle(t0).await;
    // Stopped by someone else.
    sim.stop(&old[1]).await.unwrap();
    let report = coord.cycle(t0 + CYCLE).await;
    assert!(report.terminations_started.is_empty());
    assert_eq!(
        coord.inventory().get(&old[1]).map(|i| i.state),
        Some(LifecycleState::Terminated)
    );
    assert!(coord.sequencer(&old[1]).is_none());
    assert!(drain_events(&mut rx).iter().any(|e| matches!(
        e,
        RolloutEvent::InstanceLost { instance, .. } if instance == &old[1]
    )));

    sim.fail_creates(0);
    drive(&mut coord, t0 + CYCLE * 2, 100).await;
    assert_eq!(coord.phase(), &RolloutPhase::Converged);
    assert_eq!(sim.running(&new_gen).len(), 2);
    assert!(!sim.is_running(&old[0]));
}

#[tokio::test]
async fn converged_rollout_ignores_further_cycles() {
    let sim = SimCluster::new();
    seed_old(&sim, 2);
    let mut coord = coordinator(&sim, policy(2, 0.5));
    let (now, _) = drive(&mut coord, Instant::now(), 100).await;
    assert_eq!(coord.phase(), &RolloutPhase::Converged);

    let report = coord.cycle(now + CYCLE).await;
    assert_eq!(report, CycleReport::default());
}

#[test]
fn invalid_policy_is_rejected_up_front() {
    let sim = SimCluster::new();
    let mut p = policy(2, 0.5);
    p.lb_deregistration_delay = Duration::from_secs(300);
    let err = RolloutCoordinator::new(p, Arc::new(sim.clone()), Arc::new(sim))
        .err()
        .expect("drain window shorter than the LB delay");
    assert!(matches!(err, RolloutError::InvalidPolicy(_)));
}

// ── The run loop ──────────────────────────────────────────────────

fn fast_policy(desired: u32) -> RolloutPolicy {
    let mut p = RolloutPolicy::new(
        desired,
        MaxSurge::Absolute(1),
        Duration::from_millis(50),
        spec(),
    );
    p.lb_deregistration_delay = Duration::from_millis(50);
    p.health.poll_interval = Duration::from_millis(10);
    p
}

#[tokio::test]
async fn run_converges() {
    let sim = SimCluster::new();
    seed_old(&sim, 2);
    let mut coord = coordinator(&sim, fast_policy(2));
    let (_tx, rx) = watch::channel(false);

    let outcome = tokio::time::timeout(Duration::from_secs(10), coord.run(rx))
        .await
        .expect("rollout finished in time")
        .unwrap();
    assert_eq!(outcome, RolloutOutcome::Converged);
    assert!(sim.running(&Generation::new("v1")).is_empty());
}

#[tokio::test]
async fn run_cancels_on_shutdown() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 2);
    sim.block_readiness(true);
    let mut coord = coordinator(&sim, fast_policy(2));
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { coord.run(rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("cancelled in time")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RolloutOutcome::Cancelled);
    for id in &old {
        assert!(sim.is_running(id));
    }
}

#[tokio::test]
async fn run_reports_a_stall_as_an_error() {
    let sim = SimCluster::new();
    let old = seed_old(&sim, 1);
    sim.fail_stop(&old[0], 10);
    let mut coord = coordinator(&sim, fast_policy(1));
    let (_tx, rx) = watch::channel(false);

    let err = tokio::time::timeout(Duration::from_secs(10), coord.run(rx))
        .await
        .expect("stalled in time")
        .unwrap_err();
    assert!(matches!(err, RolloutError::DrainExceeded { .. }));
    assert!(err.is_fatal());
}
