//! Process-local store honoring the same atomic contract as Redis.
//!
//! Useful for single-node deployments, the CLI simulator and tests. Outages
//! can be simulated with [`MemoryStore::set_available`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{GateOutcome, RateLimitPolicy, RateLimitSubject, SubjectState};

const SWEEP_EVERY: u64 = 1024;

/// In-memory counter store.
///
/// One mutex guards every subject, mirroring a single-threaded store that
/// executes each check as a script.
#[derive(Debug)]
pub struct MemoryStore {
    subjects: Mutex<HashMap<RateLimitSubject, SubjectState>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    checks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            subjects: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            checks: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of checks this store has executed.
    pub fn check_count(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    /// Number of subjects with live counters.
    pub fn subject_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.subjects
            .lock()
            .values()
            .filter(|state| !state.is_expired(now))
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn atomic_check_and_consume(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> Result<GateOutcome, StoreError> {
        if !self.is_available() {
            return Err(StoreError::Unavailable);
        }

        let now = self.clock.now_millis();
        let mut subjects = self.subjects.lock();

        let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if checks % SWEEP_EVERY == 0 {
            subjects.retain(|_, state| !state.is_expired(now));
        }

        // Expired subjects behave like absent keys, as with TTLs.
        let state = subjects.entry(subject.clone()).or_default();
        if state.is_expired(now) {
            *state = SubjectState::new();
        }
        Ok(state.check(now, policy, cost))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Verdict, Window, WindowLimit};
    use std::time::Duration;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new("test", vec![WindowLimit::new(Window::Minute, 2)], 10, None, 1.0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_check() {
        let store = MemoryStore::new();
        let subject = RateLimitSubject::new("user-1", None, None);

        let outcome = store.atomic_check_and_consume(&subject, &policy(), 1.0).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Admitted);
        assert_eq!(store.check_count(), 1);
        assert_eq!(store.subject_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryStore::new();
        let subject = RateLimitSubject::new("user-1", None, None);

        store.set_available(false);
        assert!(matches!(
            store.atomic_check_and_consume(&subject, &policy(), 1.0).await,
            Err(StoreError::Unavailable)
        ));
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_expires_idle_subjects() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let subject = RateLimitSubject::new("user-1", None, None);

        store.atomic_check_and_consume(&subject, &policy(), 1.0).await.unwrap();
        store.atomic_check_and_consume(&subject, &policy(), 1.0).await.unwrap();
        assert_eq!(store.subject_count(), 1);

        clock.advance(Duration::from_secs(301));
        assert_eq!(store.subject_count(), 0);

        let outcome = store.atomic_check_and_consume(&subject, &policy(), 1.0).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Admitted);
        assert_eq!(outcome.windows[0].count, 1);
    }
}
