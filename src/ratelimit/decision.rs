//! Rate limit decisions assembled from gate outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::gate::{GateOutcome, Verdict};
use super::policy::RateLimitPolicy;
use super::window::Window;

/// The limit a decision reports as binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum Scope {
    Window(Window),
    Burst,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Window(window) => write!(f, "{}", window),
            Scope::Burst => f.write_str("burst"),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

/// Why a request was rejected, so callers can pick a backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    WindowExceeded,
    BurstExceeded,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::WindowExceeded => "window_exceeded",
            RejectionReason::BurstExceeded => "burst_exceeded",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which limiter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterBackend {
    Distributed,
    Local,
}

impl fmt::Display for LimiterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterBackend::Distributed => f.write_str("distributed"),
            LimiterBackend::Local => f.write_str("local"),
        }
    }
}

/// Outcome of one rate limit evaluation. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Lowest remaining count across the policy's windows.
    pub remaining: u64,
    /// Ceiling of the binding scope.
    pub limit: u64,
    pub scope: Scope,
    pub reset_at: DateTime<Utc>,
    /// Only set on rejection.
    pub retry_after_seconds: Option<u64>,
    /// Only set on rejection.
    pub reason: Option<RejectionReason>,
    pub backend: LimiterBackend,
}

impl RateLimitDecision {
    /// Turn a gate outcome into a decision.
    ///
    /// On allow the binding scope is the window with the least room left; on
    /// a window rejection it is the violated window. Ties go to the smallest
    /// window. The retry hint waits for every gate, so a caller honoring it
    /// is not turned away by a different one.
    pub fn from_outcome(
        outcome: &GateOutcome,
        policy: &RateLimitPolicy,
        backend: LimiterBackend,
    ) -> Self {
        let windows: Vec<_> = policy
            .window_limits()
            .iter()
            .zip(outcome.windows.iter())
            .collect();

        let retry_at = windows
            .iter()
            .map(|(_, observed)| observed.free_at)
            .fold(outcome.bucket_free_at, u64::max);

        match outcome.verdict {
            Verdict::Admitted => {
                let mut binding = windows.first().copied();
                for (limit, observed) in windows.iter().copied() {
                    let remaining = limit.max_requests.saturating_sub(observed.count);
                    if binding.is_some_and(|(best, best_observed)| {
                        remaining < best.max_requests.saturating_sub(best_observed.count)
                    }) {
                        binding = Some((limit, observed));
                    }
                }

                match binding {
                    Some((limit, observed)) => Self {
                        allowed: true,
                        remaining: limit.max_requests.saturating_sub(observed.count),
                        limit: limit.max_requests,
                        scope: Scope::Window(limit.window),
                        reset_at: millis_to_datetime(observed.reset_at),
                        retry_after_seconds: None,
                        reason: None,
                        backend,
                    },
                    None => Self {
                        allowed: true,
                        remaining: 0,
                        limit: policy.burst_size(),
                        scope: Scope::Burst,
                        reset_at: millis_to_datetime(outcome.now),
                        retry_after_seconds: None,
                        reason: None,
                        backend,
                    },
                }
            }
            Verdict::WindowExceeded => {
                let violated = windows
                    .iter()
                    .copied()
                    .find(|(limit, observed)| observed.count >= limit.max_requests)
                    .or_else(|| windows.first().copied());

                let (limit, scope, reset_at) = match violated {
                    Some((limit, observed)) => (
                        limit.max_requests,
                        Scope::Window(limit.window),
                        observed.reset_at,
                    ),
                    None => (policy.burst_size(), Scope::Burst, retry_at),
                };

                Self::rejected(
                    outcome.now,
                    limit,
                    scope,
                    reset_at,
                    retry_at,
                    RejectionReason::WindowExceeded,
                    backend,
                )
            }
            Verdict::BurstExceeded => Self::rejected(
                outcome.now,
                policy.burst_size(),
                Scope::Burst,
                outcome.bucket_free_at,
                retry_at,
                RejectionReason::BurstExceeded,
                backend,
            ),
        }
    }

    fn rejected(
        now: u64,
        limit: u64,
        scope: Scope,
        reset_at: u64,
        retry_at: u64,
        reason: RejectionReason,
        backend: LimiterBackend,
    ) -> Self {
        // Round up: a hint is never earlier than the capacity it promises.
        let wait_ms = retry_at.saturating_sub(now);
        let retry_after = wait_ms.div_ceil(1000).max(1);

        Self {
            allowed: false,
            remaining: 0,
            limit,
            scope,
            reset_at: millis_to_datetime(reset_at),
            retry_after_seconds: Some(retry_after),
            reason: Some(reason),
            backend,
        }
    }

    /// Reset time as whole epoch seconds, rounded up.
    pub fn reset_epoch_seconds(&self) -> i64 {
        let millis = self.reset_at.timestamp_millis();
        millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) != 0)
    }
}

fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::gate::WindowObservation;
    use crate::ratelimit::window::WindowLimit;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new(
            "test",
            vec![
                WindowLimit::new(Window::Minute, 10),
                WindowLimit::new(Window::Hour, 100),
            ],
            5,
            None,
            1.0,
        )
        .unwrap()
    }

    fn observation(count: u64, reset_at: u64, free_at: u64) -> WindowObservation {
        WindowObservation {
            count,
            reset_at,
            free_at,
        }
    }

    #[test]
    fn test_allowed_reports_tightest_window() {
        let outcome = GateOutcome {
            now: 1_000,
            verdict: Verdict::Admitted,
            windows: vec![observation(4, 61_000, 1_000), observation(98, 3_601_000, 1_000)],
            tokens: 3.0,
            bucket_free_at: 1_000,
        };

        let decision = RateLimitDecision::from_outcome(&outcome, &policy(), LimiterBackend::Local);
        assert!(decision.allowed);
        assert_eq!(decision.scope, Scope::Window(Window::Hour));
        assert_eq!(decision.limit, 100);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.retry_after_seconds, None);
        assert_eq!(decision.reason, None);
        assert_eq!(decision.reset_epoch_seconds(), 3_601);
    }

    #[test]
    fn test_tie_goes_to_smallest_window() {
        let outcome = GateOutcome {
            now: 0,
            verdict: Verdict::Admitted,
            windows: vec![observation(5, 60_000, 0), observation(95, 3_600_000, 0)],
            tokens: 3.0,
            bucket_free_at: 0,
        };

        let decision = RateLimitDecision::from_outcome(&outcome, &policy(), LimiterBackend::Local);
        assert_eq!(decision.scope, Scope::Window(Window::Minute));
        assert_eq!(decision.remaining, 5);
    }

    #[test]
    fn test_window_rejection_waits_for_every_gate() {
        let outcome = GateOutcome {
            now: 10_000,
            verdict: Verdict::WindowExceeded,
            windows: vec![observation(10, 60_500, 60_500), observation(10, 3_600_000, 10_000)],
            tokens: 0.0,
            bucket_free_at: 70_200,
        };

        let decision =
            RateLimitDecision::from_outcome(&outcome, &policy(), LimiterBackend::Distributed);
        assert!(!decision.allowed);
        assert_eq!(decision.scope, Scope::Window(Window::Minute));
        assert_eq!(decision.reason, Some(RejectionReason::WindowExceeded));
        assert_eq!(decision.remaining, 0);
        // Bucket is the later gate: 60.2s rounds up to 61.
        assert_eq!(decision.retry_after_seconds, Some(61));
    }

    #[test]
    fn test_both_windows_full_reports_smallest() {
        let outcome = GateOutcome {
            now: 0,
            verdict: Verdict::WindowExceeded,
            windows: vec![observation(10, 30_000, 30_000), observation(100, 900_000, 900_000)],
            tokens: 5.0,
            bucket_free_at: 0,
        };

        let decision = RateLimitDecision::from_outcome(&outcome, &policy(), LimiterBackend::Local);
        assert_eq!(decision.scope, Scope::Window(Window::Minute));
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.retry_after_seconds, Some(900));
    }

    #[test]
    fn test_burst_rejection() {
        let outcome = GateOutcome {
            now: 5_000,
            verdict: Verdict::BurstExceeded,
            windows: vec![observation(5, 60_000, 5_000), observation(5, 3_600_000, 5_000)],
            tokens: 0.2,
            bucket_free_at: 5_001,
        };

        let decision = RateLimitDecision::from_outcome(&outcome, &policy(), LimiterBackend::Local);
        assert!(!decision.allowed);
        assert_eq!(decision.scope, Scope::Burst);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.reason, Some(RejectionReason::BurstExceeded));
        assert_eq!(decision.retry_after_seconds, Some(1));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::Window(Window::Minute).to_string(), "minute");
        assert_eq!(Scope::Window(Window::Seconds(90)).to_string(), "90s");
        assert_eq!(Scope::Burst.to_string(), "burst");
        assert_eq!(RejectionReason::BurstExceeded.to_string(), "burst_exceeded");
    }
}
