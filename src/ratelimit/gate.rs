//! The two-gate check: sliding windows first, then the token bucket.
//!
//! [`SubjectState`] is the in-memory rendition used by the local fallback
//! limiter and by [`crate::store::MemoryStore`]. The Redis store runs the same
//! steps inside a Lua script and reports them as the same [`GateOutcome`], so
//! decision assembly is shared by every backend.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;

use super::policy::RateLimitPolicy;

/// Slack for float rounding when comparing bucket tokens against a cost.
pub const TOKEN_EPSILON: f64 = 1e-6;

/// Which gate, if any, stopped the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Admitted,
    WindowExceeded,
    BurstExceeded,
}

/// State of one window after a check. All times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WindowObservation {
    /// Entries inside the window once the check completed.
    pub count: u64,
    /// When the oldest entry leaves the window.
    pub reset_at: u64,
    /// Earliest time the window has room for one more request.
    pub free_at: u64,
}

/// Raw result of one atomic check, before it becomes a decision.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateOutcome {
    pub now: u64,
    pub verdict: Verdict,
    /// One entry per policy window, in policy order.
    pub windows: Vec<WindowObservation>,
    /// Bucket tokens once the check completed.
    pub tokens: f64,
    /// Earliest time the bucket holds enough tokens for this request's cost.
    pub bucket_free_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

/// Counter state for one subject.
#[derive(Debug, Default)]
pub struct SubjectState {
    /// Admitted request timestamps keyed by window span in milliseconds.
    windows: HashMap<u64, VecDeque<u64>>,
    bucket: Option<BucketState>,
    last_seen: u64,
    retention: u64,
}

impl SubjectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run both gates for one request at time `now`.
    ///
    /// Rejected requests leave window counters untouched, and the bucket is
    /// only debited once every window has passed.
    pub fn check(&mut self, now: u64, policy: &RateLimitPolicy, cost: f64) -> GateOutcome {
        self.last_seen = now;
        self.retention = policy.retention_millis();

        let limits = policy.window_limits();
        self.windows.retain(|span, _| {
            limits
                .iter()
                .any(|limit| limit.window.as_millis() == *span)
        });

        let mut observations = Vec::with_capacity(limits.len());
        let mut window_exceeded = false;

        for limit in limits {
            let span = limit.window.as_millis();
            let entries = self.windows.entry(span).or_default();

            while entries.front().is_some_and(|ts| ts + span <= now) {
                entries.pop_front();
            }

            let count = entries.len() as u64;
            let free_at = if count >= limit.max_requests {
                window_exceeded = true;
                // Room opens when enough of the oldest entries have expired.
                let idx = (count - limit.max_requests) as usize;
                entries[idx] + span
            } else {
                now
            };

            observations.push(WindowObservation {
                count,
                reset_at: 0,
                free_at,
            });
        }

        let burst = policy.burst_size() as f64;
        let rate = policy.refill_rate();
        let bucket = self.bucket.get_or_insert(BucketState {
            tokens: burst,
            last_refill: now,
        });

        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        let mut tokens = (bucket.tokens + elapsed * rate / 1000.0).min(burst);
        let bucket_free_at = if tokens + TOKEN_EPSILON >= cost {
            now
        } else {
            now + ((cost - tokens) * 1000.0 / rate).ceil() as u64
        };

        let verdict = if window_exceeded {
            Verdict::WindowExceeded
        } else if tokens + TOKEN_EPSILON < cost {
            Verdict::BurstExceeded
        } else {
            tokens = (tokens - cost).max(0.0);
            *bucket = BucketState {
                tokens,
                last_refill: now,
            };
            for (limit, observation) in limits.iter().zip(observations.iter_mut()) {
                if let Some(entries) = self.windows.get_mut(&limit.window.as_millis()) {
                    entries.push_back(now);
                }
                observation.count += 1;
            }
            Verdict::Admitted
        };

        for (limit, observation) in limits.iter().zip(observations.iter_mut()) {
            let span = limit.window.as_millis();
            observation.reset_at = self
                .windows
                .get(&span)
                .and_then(|entries| entries.front())
                .map_or(now + span, |oldest| oldest + span);
        }

        GateOutcome {
            now,
            verdict,
            windows: observations,
            tokens,
            bucket_free_at,
        }
    }

    /// Time of the most recent check.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// True once the subject has been idle longer than its policy retains
    /// state; an expired subject behaves exactly like a fresh one.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) >= self.retention
    }
}
