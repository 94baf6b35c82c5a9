//! Rollout policy file parser.
//!
//! A policy is a TOML document with `[rollout]`, `[generation]`, and
//! optional `[health]` and `[termination]` tables. Loading resolves the
//! compact duration strings and validates the policy as a whole.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PolicyError, PolicyResult};
use crate::types::{Generation, MaxSurge, RolloutPlan};

// ── File layout ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct PolicyFile {
    rollout: RolloutSection,
    generation: GenerationSpec,
    #[serde(default)]
    health: HealthSection,
    #[serde(default)]
    termination: TerminationSection,
}

#[derive(Debug, Clone, Deserialize)]
struct RolloutSection {
    replicas: u32,
    max_surge: SurgeValue,
    drain_window: String,
    lb_deregistration_delay: String,
    progress_deadline: Option<String>,
    #[serde(default)]
    drain_trigger: DrainTrigger,
    deregister_ack_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SurgeValue {
    Count(u32),
    Fraction(f64),
    Percent(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HealthSection {
    poll_interval: Option<String>,
    poll_timeout: Option<String>,
    recheck_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TerminationSection {
    max_stop_attempts: Option<u32>,
    stop_backoff: Option<String>,
    max_stop_backoff: Option<String>,
}

// ── Resolved policy ───────────────────────────────────────────────

/// The deployment spec for the generation being rolled out. Opaque to
/// the coordinator apart from its revision hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl GenerationSpec {
    /// First 10 hex chars of the SHA-256 of the spec's JSON form.
    pub fn revision(&self) -> String {
        // BTreeMap keeps key order stable, so the JSON form is canonical.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&bytes));
        digest[..10].to_string()
    }

    /// Generation label: `{name}-{revision}`.
    pub fn generation(&self) -> Generation {
        Generation::new(format!("{}-{}", self.name, self.revision()))
    }
}

/// When the drain timer of a retiring instance starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Once the load balancer reports the target deregistering (or the
    /// acknowledgement timeout passes).
    #[default]
    Acknowledged,
    /// Right after deregistration was requested.
    Immediate,
}

/// Target health polling cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTiming {
    pub poll_interval: Duration,
    /// Upper bound on a single oracle or readiness call.
    pub poll_timeout: Duration,
    /// Minimum gap before a negative reading may be confirmed.
    pub recheck_interval: Duration,
}

impl Default for HealthTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(2),
            recheck_interval: Duration::from_secs(10),
        }
    }
}

/// Stop retry behaviour for the termination sequencer.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationPolicy {
    pub max_stop_attempts: u32,
    pub stop_backoff: Duration,
    pub max_stop_backoff: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            max_stop_attempts: 3,
            stop_backoff: Duration::from_secs(1),
            max_stop_backoff: Duration::from_secs(30),
        }
    }
}

impl TerminationPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.stop_backoff * factor).min(self.max_stop_backoff)
    }
}

/// A validated rollout policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPolicy {
    pub desired: u32,
    pub max_surge: MaxSurge,
    pub drain_window: Duration,
    /// The load balancer's own deregistration delay.
    pub lb_deregistration_delay: Duration,
    /// How long a new instance may take to reach in-service.
    pub progress_deadline: Duration,
    pub drain_trigger: DrainTrigger,
    pub deregister_ack_timeout: Duration,
    pub generation: GenerationSpec,
    pub health: HealthTiming,
    pub termination: TerminationPolicy,
}

impl RolloutPolicy {
    /// A policy with default timings.
    pub fn new(
        desired: u32,
        max_surge: MaxSurge,
        drain_window: Duration,
        generation: GenerationSpec,
    ) -> Self {
        Self {
            desired,
            max_surge,
            drain_window,
            lb_deregistration_delay: drain_window,
            progress_deadline: Duration::from_secs(600),
            drain_trigger: DrainTrigger::default(),
            deregister_ack_timeout: Duration::from_secs(30),
            generation,
            health: HealthTiming::default(),
            termination: TerminationPolicy::default(),
        }
    }

    pub fn from_file(path: &Path) -> PolicyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> PolicyResult<Self> {
        let file: PolicyFile = toml::from_str(s)?;
        let policy = Self::resolve(file)?;
        policy.validate()?;
        Ok(policy)
    }

    fn resolve(file: PolicyFile) -> PolicyResult<Self> {
        let r = file.rollout;
        let health_defaults = HealthTiming::default();
        let term_defaults = TerminationPolicy::default();

        let drain_window = required_duration("drain_window", &r.drain_window)?;
        Ok(Self {
            desired: r.replicas,
            max_surge: resolve_surge(&r.max_surge)?,
            drain_window,
            lb_deregistration_delay: required_duration(
                "lb_deregistration_delay",
                &r.lb_deregistration_delay,
            )?,
            progress_deadline: optional_duration(
                "progress_deadline",
                r.progress_deadline.as_deref(),
                Duration::from_secs(600),
            )?,
            drain_trigger: r.drain_trigger,
            deregister_ack_timeout: optional_duration(
                "deregister_ack_timeout",
                r.deregister_ack_timeout.as_deref(),
                Duration::from_secs(30),
            )?,
            generation: file.generation,
            health: HealthTiming {
                poll_interval: optional_duration(
                    "poll_interval",
                    file.health.poll_interval.as_deref(),
                    health_defaults.poll_interval,
                )?,
                poll_timeout: optional_duration(
                    "poll_timeout",
                    file.health.poll_timeout.as_deref(),
                    health_defaults.poll_timeout,
                )?,
                recheck_interval: optional_duration(
                    "recheck_interval",
                    file.health.recheck_interval.as_deref(),
                    health_defaults.recheck_interval,
                )?,
            },
            termination: TerminationPolicy {
                max_stop_attempts: file
                    .termination
                    .max_stop_attempts
                    .unwrap_or(term_defaults.max_stop_attempts),
                stop_backoff: optional_duration(
                    "stop_backoff",
                    file.termination.stop_backoff.as_deref(),
                    term_defaults.stop_backoff,
                )?,
                max_stop_backoff: optional_duration(
                    "max_stop_backoff",
                    file.termination.max_stop_backoff.as_deref(),
                    term_defaults.max_stop_backoff,
                )?,
            },
        })
    }

    /// Check the policy as a whole.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.desired == 0 {
            return Err(PolicyError::Invalid("replicas must be at least 1".into()));
        }
        // With max_unavailable fixed at 0, a zero surge can never make progress.
        if self.max_surge.capacity(self.desired) == 0 {
            return Err(PolicyError::InvalidSurge(
                "surge capacity is 0; the rollout could never progress".into(),
            ));
        }
        if self.drain_window < self.lb_deregistration_delay {
            return Err(PolicyError::Invalid(format!(
                "drain_window ({:?}) is shorter than lb_deregistration_delay ({:?})",
                self.drain_window, self.lb_deregistration_delay
            )));
        }
        if self.termination.max_stop_attempts == 0 {
            return Err(PolicyError::Invalid(
                "max_stop_attempts must be at least 1".into(),
            ));
        }
        if self.health.poll_timeout.is_zero() {
            return Err(PolicyError::Invalid("poll_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Snapshot for one coordinator cycle.
    pub fn plan(&self) -> RolloutPlan {
        RolloutPlan {
            desired: self.desired,
            max_surge: self.max_surge,
            max_unavailable: 0,
            drain_window: self.drain_window,
            generation: self.generation.generation(),
        }
    }
}

fn resolve_surge(value: &SurgeValue) -> PolicyResult<MaxSurge> {
    match value {
        SurgeValue::Count(n) => Ok(MaxSurge::Absolute(*n)),
        SurgeValue::Fraction(f) => {
            if !f.is_finite() || *f <= 0.0 {
                return Err(PolicyError::InvalidSurge(format!("{f}")));
            }
            Ok(MaxSurge::Fraction(*f))
        }
        SurgeValue::Percent(s) => {
            let pct = s
                .trim()
                .strip_suffix('%')
                .and_then(|p| p.trim().parse::<f64>().ok())
                .filter(|p| p.is_finite() && *p > 0.0)
                .ok_or_else(|| PolicyError::InvalidSurge(s.clone()))?;
            Ok(MaxSurge::Fraction(pct / 100.0))
        }
    }
}

fn required_duration(field: &'static str, value: &str) -> PolicyResult<Duration> {
    parse_duration(value).ok_or_else(|| PolicyError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

fn optional_duration(
    field: &'static str,
    value: Option<&str>,
    default: Duration,
) -> PolicyResult<Duration> {
    match value {
        Some(v) => required_duration(field, v),
        None => Ok(default),
    }
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
