//! ebbgrid-sim — an in-memory cluster for rehearsing rollouts.
//!
//! [`SimCluster`] implements both [`PodLifecycleManager`] and
//! [`TargetHealthOracle`]: pods become ready after `ready_delay`, their
//! targets turn in-service `registration_delay` later, and deregistration
//! flips the target to draining. Faults can be injected per pod so the
//! coordinator's failure paths can be exercised without real
//! infrastructure.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tracing::debug;

use ebb_core::{Generation, GenerationSpec, TargetRegistration};
use ebbgrid_health::TargetHealthOracle;
use ebbgrid_pods::{PodLifecycleManager, PodRecord};

/// Timing of the simulated cluster.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Time from creation until the pod reports ready.
    pub ready_delay: Duration,
    /// Time from readiness until the load balancer marks the target healthy.
    pub registration_delay: Duration,
}

#[derive(Debug)]
struct SimPod {
    record: PodRecord,
    started: Instant,
    /// Seeded pods stand for the existing fleet and ignore `block_readiness`.
    seeded: bool,
    running: bool,
    deregistered: bool,
    stop_attempts: u32,
    fail_stops: u32,
    fail_deregistrations: u32,
    fail_in_service: u32,
    /// Keep reporting the target as registered after deregistration.
    withhold_ack: bool,
    /// Scripted answers for `is_in_service`, consumed front to back.
    in_service_script: VecDeque<bool>,
}

#[derive(Debug, Default)]
struct SimState {
    pods: BTreeMap<String, SimPod>,
    next_index: u64,
    clock_ms: u64,
    fail_creates: u32,
    block_readiness: bool,
    creates: u32,
    stops: u32,
}

/// Simulated pods plus load balancer. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimCluster {
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// A cluster where pods are ready and in service immediately.
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let clock_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                clock_ms,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a running, in-service pod of `generation`. Returns its id.
    pub fn seed_in_service(&self, generation: &str, created_at: u64) -> String {
        let mut st = self.lock();
        let id = format!("{generation}-{:03}", st.next_index);
        st.next_index += 1;
        let now = Instant::now();
        let started = now
            .checked_sub(self.config.ready_delay + self.config.registration_delay)
            .unwrap_or(now);
        st.pods.insert(
            id.clone(),
            SimPod::new(
                PodRecord {
                    id: id.clone(),
                    generation: Generation::new(generation),
                    created_at,
                },
                started,
                true,
            ),
        );
        id
    }

    /// Make the next `n` stops of `id` fail.
    pub fn fail_stop(&self, id: &str, n: u32) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.fail_stops = n;
        }
    }

    /// Make the next `n` deregistration requests for `id` fail.
    pub fn fail_deregistration(&self, id: &str, n: u32) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.fail_deregistrations = n;
        }
    }

    /// Make the next `n` `is_in_service` polls of `id` fail.
    pub fn fail_in_service(&self, id: &str, n: u32) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.fail_in_service = n;
        }
    }

    /// Keep reporting `id` as registered after deregistration.
    pub fn delay_deregistration_ack(&self, id: &str, withhold: bool) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.withhold_ack = withhold;
        }
    }

    /// Queue answers for the next `is_in_service` polls of `id`.
    pub fn script_in_service(&self, id: &str, answers: &[bool]) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.in_service_script.extend(answers.iter().copied());
        }
    }

    /// Make the next `n` creates fail.
    pub fn fail_creates(&self, n: u32) {
        self.lock().fail_creates = n;
    }

    /// While set, created pods do not report ready.
    pub fn block_readiness(&self, block: bool) {
        self.lock().block_readiness = block;
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().pods.get(id).is_some_and(|p| p.running)
    }

    pub fn stop_attempts(&self, id: &str) -> u32 {
        self.lock().pods.get(id).map_or(0, |p| p.stop_attempts)
    }

    /// Ids of running pods of `generation`.
    pub fn running(&self, generation: &Generation) -> Vec<String> {
        self.lock()
            .pods
            .values()
            .filter(|p| p.running && &p.record.generation == generation)
            .map(|p| p.record.id.clone())
            .collect()
    }

    /// Successful creates so far.
    pub fn creates(&self) -> u32 {
        self.lock().creates
    }

    /// Successful stops so far.
    pub fn stops(&self) -> u32 {
        self.lock().stops
    }

    fn target_state(&self, pod: &SimPod, block_readiness: bool) -> TargetRegistration {
        let age = pod.started.elapsed();
        if !pod.running {
            TargetRegistration::Unregistered
        } else if pod.deregistered {
            TargetRegistration::Deregistering
        } else if (block_readiness && !pod.seeded) || age < self.config.ready_delay {
            TargetRegistration::Unregistered
        } else if age < self.config.ready_delay + self.config.registration_delay {
            TargetRegistration::Registering
        } else {
            TargetRegistration::InService
        }
    }
}

impl SimPod {
    fn new(record: PodRecord, started: Instant, seeded: bool) -> Self {
        Self {
            record,
            started,
            seeded,
            running: true,
            deregistered: false,
            stop_attempts: 0,
            fail_stops: 0,
            fail_deregistrations: 0,
            fail_in_service: 0,
            withhold_ack: false,
            in_service_script: VecDeque::new(),
        }
    }
}

#[async_trait]
impl PodLifecycleManager for SimCluster {
    async fn create(&self, spec: &GenerationSpec) -> anyhow::Result<PodRecord> {
        let generation = spec.generation();
        let mut st = self.lock();
        if st.fail_creates > 0 {
            st.fail_creates -= 1;
            bail!("simulated create failure");
        }
        st.clock_ms += 1;
        let record = PodRecord {
            id: format!("{generation}-{:03}", st.next_index),
            generation,
            created_at: st.clock_ms,
        };
        st.next_index += 1;
        st.creates += 1;
        st.pods
            .insert(record.id.clone(), SimPod::new(record.clone(), Instant::now(), false));
        debug!(instance = %record.id, "sim pod created");
        Ok(record)
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut st = self.lock();
        let Some(pod) = st.pods.get_mut(instance_id) else {
            // Already gone.
            return Ok(());
        };
        pod.stop_attempts += 1;
        if pod.fail_stops > 0 {
            pod.fail_stops -= 1;
            bail!("simulated stop failure for {instance_id}");
        }
        let was_running = std::mem::replace(&mut pod.running, false);
        if was_running {
            st.stops += 1;
        }
        debug!(instance = %instance_id, "sim pod stopped");
        Ok(())
    }

    async fn is_ready(&self, instance_id: &str) -> anyhow::Result<bool> {
        let st = self.lock();
        let pod = st
            .pods
            .get(instance_id)
            .ok_or_else(|| anyhow!("unknown pod {instance_id}"))?;
        let blocked = st.block_readiness && !pod.seeded;
        Ok(pod.running && !blocked && pod.started.elapsed() >= self.config.ready_delay)
    }

    async fn list(&self) -> anyhow::Result<Vec<PodRecord>> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| p.running)
            .map(|p| p.record.clone())
            .collect())
    }
}

#[async_trait]
impl TargetHealthOracle for SimCluster {
    async fn is_in_service(&self, instance_id: &str) -> anyhow::Result<bool> {
        let mut st = self.lock();
        let block = st.block_readiness;
        let pod = st
            .pods
            .get_mut(instance_id)
            .ok_or_else(|| anyhow!("unknown target {instance_id}"))?;
        if pod.fail_in_service > 0 {
            pod.fail_in_service -= 1;
            bail!("simulated health check failure for {instance_id}");
        }
        if let Some(answer) = pod.in_service_script.pop_front() {
            return Ok(answer);
        }
        let pod = &*pod;
        Ok(self.target_state(pod, block).is_in_service())
    }

    async fn is_registered(&self, instance_id: &str) -> anyhow::Result<bool> {
        let st = self.lock();
        let pod = st
            .pods
            .get(instance_id)
            .ok_or_else(|| anyhow!("unknown target {instance_id}"))?;
        if pod.deregistered && pod.withhold_ack {
            return Ok(true);
        }
        Ok(self.target_state(pod, st.block_readiness).is_registered())
    }

    async fn request_deregistration(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut st = self.lock();
        let Some(pod) = st.pods.get_mut(instance_id) else {
            return Ok(());
        };
        if pod.fail_deregistrations > 0 {
            pod.fail_deregistrations -= 1;
            bail!("simulated deregistration failure for {instance_id}");
        }
        pod.deregistered = true;
        debug!(instance = %instance_id, "sim target deregistering");
        Ok(())
    }
}
