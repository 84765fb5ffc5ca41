//! Distributed rate limiter backed by a shared counter store.
//!
//! Every check is delegated to the store's atomic check-and-consume, so all
//! server processes pointed at the same store enforce one set of limits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::decision::{LimiterBackend, RateLimitDecision};
use super::policy::RateLimitPolicy;
use super::subject::RateLimitSubject;
use crate::store::{CounterStore, StoreError};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(25);

/// A rate limiter whose counters live in a [`CounterStore`].
#[derive(Clone)]
pub struct DistributedRateLimiter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check and consume for one request. `cost` is the effective cost.
    ///
    /// Any store failure, including a slow answer, is returned as an error;
    /// it is never turned into a decision here.
    pub async fn check(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> Result<RateLimitDecision, StoreError> {
        trace!(
            subject = %subject,
            policy = policy.name(),
            cost,
            "Checking distributed rate limit"
        );

        let outcome = tokio::time::timeout(
            self.timeout,
            self.store.atomic_check_and_consume(subject, policy, cost),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.timeout))??;

        let decision = RateLimitDecision::from_outcome(&outcome, policy, LimiterBackend::Distributed);
        if !decision.allowed {
            debug!(
                subject = %subject,
                scope = %decision.scope,
                "Distributed rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Ask the store whether it is reachable.
    ///
    /// A missing connection is established first under the store's connect
    /// timeout; only the round trip itself is bounded by the check timeout.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ensure_connected().await?;
        tokio::time::timeout(self.timeout, self.store.ping())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("store", &self.store.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
