//! In-process fallback limiter.
//!
//! Used while the shared store is unreachable. Counters live only in this
//! process, so limits are enforced per instance rather than cluster-wide.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::decision::{LimiterBackend, RateLimitDecision};
use super::gate::{GateOutcome, SubjectState};
use super::policy::RateLimitPolicy;
use super::subject::RateLimitSubject;
use crate::clock::{Clock, SystemClock};

/// Default cap on tracked subjects.
pub const DEFAULT_MAX_SUBJECTS: usize = 100_000;

/// Thread-safe in-memory limiter.
///
/// Each subject's state sits behind its own mutex, so checks for one subject
/// are serialized while different subjects proceed in parallel.
#[derive(Debug)]
pub struct LocalRateLimiter {
    subjects: DashMap<RateLimitSubject, Mutex<SubjectState>>,
    clock: Arc<dyn Clock>,
    max_subjects: usize,
}

impl LocalRateLimiter {
    pub fn new(max_subjects: usize) -> Self {
        Self::with_clock(max_subjects, Arc::new(SystemClock))
    }

    pub fn with_clock(max_subjects: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            subjects: DashMap::new(),
            clock,
            max_subjects: max_subjects.max(1),
        }
    }

    /// Check and consume for one request. `cost` is the effective cost.
    pub fn check(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> RateLimitDecision {
        let now = self.clock.now_millis();

        if !self.subjects.contains_key(subject) && self.subjects.len() >= self.max_subjects {
            self.make_room(now);
        }

        // The map entry stays borrowed until the check is done, so a sweep
        // cannot replace the state while it is in use.
        let outcome = match self.subjects.get(subject) {
            Some(state) => Self::check_state(&state, now, policy, cost),
            None => {
                let state = self.subjects.entry(subject.clone()).or_insert_with(|| {
                    debug!(subject = %subject, "Tracking new local subject");
                    Mutex::new(SubjectState::new())
                });
                Self::check_state(&state, now, policy, cost)
            }
        };

        trace!(
            subject = %subject,
            policy = policy.name(),
            verdict = ?outcome.verdict,
            "Local rate limit check"
        );

        RateLimitDecision::from_outcome(&outcome, policy, LimiterBackend::Local)
    }

    fn check_state(
        state: &Mutex<SubjectState>,
        now: u64,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> GateOutcome {
        let mut state = state.lock();
        if state.is_expired(now) {
            *state = SubjectState::new();
        }
        state.check(now, policy, cost)
    }

    /// Free at least one slot: drop expired subjects first, then the least
    /// recently active one.
    fn make_room(&self, now: u64) {
        let removed = self.sweep_at(now);
        if self.subjects.len() < self.max_subjects {
            return;
        }

        let oldest = self
            .subjects
            .iter()
            .min_by_key(|entry| entry.value().lock().last_seen())
            .map(|entry| entry.key().clone());

        if let Some(subject) = oldest {
            warn!(
                subject = %subject,
                swept = removed,
                max_subjects = self.max_subjects,
                "Local limiter at capacity, evicting least recently active subject"
            );
            self.subjects.remove(&subject);
        }
    }

    /// Remove subjects whose state has expired. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now_millis())
    }

    fn sweep_at(&self, now: u64) -> usize {
        let before = self.subjects.len();
        self.subjects
            .retain(|_, state| !state.lock().is_expired(now));
        let removed = before.saturating_sub(self.subjects.len());
        if removed > 0 {
            debug!(removed, "Swept expired local subjects");
        }
        removed
    }

    /// Sweep on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn clear(&self) {
        self.subjects.clear();
    }
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBJECTS)
    }
}
