//! Stale-read guard for in-service instances.
//!
//! Oracle readings may lag a poll cycle behind. A single "not in
//! service" reading therefore only makes an instance suspect; it is
//! confirmed out only when a later reading, taken at least
//! `recheck_interval` after the first, agrees.

use std::time::{Duration, Instant};

use tracing::debug;

use ebb_core::Reading;

/// What the coordinator may conclude about an in-service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerdict {
    InService,
    /// One or more negative readings, not yet re-confirmed.
    Suspect,
    /// Negative readings re-confirmed across the recheck interval.
    ConfirmedOut,
}

/// Tracks consecutive in-service readings for a single instance.
#[derive(Debug)]
pub struct ServiceTracker {
    verdict: ServiceVerdict,
    /// When the current run of negative readings began.
    suspect_since: Option<Instant>,
    consecutive_misses: u32,
    recheck_interval: Duration,
}

impl ServiceTracker {
    pub fn new(recheck_interval: Duration) -> Self {
        Self {
            verdict: ServiceVerdict::InService,
            suspect_since: None,
            consecutive_misses: 0,
            recheck_interval,
        }
    }

    /// Record a reading taken at `now` and return the new verdict.
    pub fn record(&mut self, reading: Reading, now: Instant) -> ServiceVerdict {
        if self.verdict == ServiceVerdict::ConfirmedOut {
            return self.verdict;
        }

        match reading {
            Reading::Yes => {
                if self.verdict == ServiceVerdict::Suspect {
                    debug!(
                        misses = self.consecutive_misses,
                        "negative reading not confirmed, instance back in service"
                    );
                }
                self.consecutive_misses = 0;
                self.suspect_since = None;
                self.verdict = ServiceVerdict::InService;
            }
            Reading::No => {
                self.consecutive_misses += 1;
                let since = *self.suspect_since.get_or_insert(now);
                if self.consecutive_misses >= 2
                    && now.saturating_duration_since(since) >= self.recheck_interval
                {
                    debug!(
                        misses = self.consecutive_misses,
                        "negative readings confirmed"
                    );
                    self.verdict = ServiceVerdict::ConfirmedOut;
                } else {
                    self.verdict = ServiceVerdict::Suspect;
                }
            }
            // Unknown is neither evidence for nor against.
            Reading::Unknown => {}
        }

        self.verdict
    }

    pub fn verdict(&self) -> ServiceVerdict {
        self.verdict
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }
}
