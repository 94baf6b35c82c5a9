//! `ebbd simulate` — rehearse a rollout against the in-memory cluster.
//!
//! Cycles run back to back on a virtual clock advanced by the poll
//! interval, so a rollout with three-minute drain windows finishes in
//! well under a second.

use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ebb_core::RolloutPolicy;
use ebbgrid_rollout::{RolloutCoordinator, RolloutEvent, RolloutPhase};
use ebbgrid_sim::SimCluster;

/// Upper bound on simulated cycles.
const MAX_CYCLES: u32 = 100_000;

/// Shape of the simulated fleet and the faults to inject.
#[derive(Debug, Clone, Copy)]
pub struct Faults {
    pub old_replicas: u32,
    pub fail_stop: u32,
    pub flap: bool,
}

pub async fn run(policy: RolloutPolicy, faults: Faults) -> anyhow::Result<()> {
    let sim = SimCluster::new();
    let old: Vec<String> = (0..faults.old_replicas)
        .map(|i| sim.seed_in_service("old", 1_000 + u64::from(i)))
        .collect();

    if let Some(oldest) = old.first().filter(|_| faults.fail_stop > 0) {
        info!(instance = %oldest, failures = faults.fail_stop, "injecting stop failures");
        sim.fail_stop(oldest, faults.fail_stop);
    }
    if let Some(flapper) = old.last().filter(|_| faults.flap) {
        info!(instance = %flapper, "injecting a single unhealthy reading");
        sim.script_in_service(flapper, &[true, false, true]);
    }

    let step = policy.health.poll_interval;
    let mut coord = RolloutCoordinator::new(policy, Arc::new(sim.clone()), Arc::new(sim.clone()))?;
    let mut events = coord.subscribe();

    let start = Instant::now();
    let mut now = start;
    for _ in 0..MAX_CYCLES {
        coord.cycle(now).await;
        print_events(&mut events)?;

        let stalled = matches!(coord.phase(), RolloutPhase::Stalled { .. });
        if coord.phase().is_final() || (stalled && !coord.has_active_drains()) {
            break;
        }
        now += step;
    }

    let status = coord.status();
    println!("{}", serde_json::to_string(&status)?);
    let elapsed = now.saturating_duration_since(start);

    match coord.phase() {
        RolloutPhase::Converged => {
            info!(
                simulated_secs = elapsed.as_secs(),
                creates = sim.creates(),
                stops = sim.stops(),
                "simulated rollout converged"
            );
            Ok(())
        }
        RolloutPhase::Stalled { reason } => bail!("simulated rollout stalled: {reason}"),
        phase => bail!("simulated rollout did not settle: {phase:?}"),
    }
}

fn print_events(events: &mut broadcast::Receiver<RolloutEvent>) -> anyhow::Result<()> {
    loop {
        match events.try_recv() {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                warn!(skipped = n, "event stream lagged");
            }
            Err(_) => return Ok(()),
        }
    }
}
