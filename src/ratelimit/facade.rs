//! Single entry point for request-handling middleware.
//!
//! The facade resolves the policy, routes the check to the distributed
//! limiter while the store is healthy and to the local limiter while it is
//! degraded, and publishes a usage event for every decision.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::decision::RateLimitDecision;
use super::distributed::DistributedRateLimiter;
use super::local::LocalRateLimiter;
use super::resolver::PolicyResolver;
use super::subject::SubjectInput;
use crate::events::{EventEmitter, EventKind, UsageEvent};
use crate::store::StoreError;

/// Which limiter the facade currently routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Routing to the distributed limiter.
    Healthy,
    /// Routing to the local fallback limiter.
    Degraded,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => f.write_str("HEALTHY"),
            HealthState::Degraded => f.write_str("DEGRADED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    /// When the current state was entered.
    pub since: DateTime<Utc>,
    /// Number of HEALTHY to DEGRADED transitions so far.
    pub failovers: u64,
    /// False when no shared store is configured at all.
    pub store_configured: bool,
}

/// The rate limiter facade.
///
/// `evaluate` always produces a decision. Store failures switch the facade
/// to DEGRADED; only a successful probe switches it back.
pub struct RateLimiter {
    resolver: Arc<PolicyResolver>,
    distributed: Option<DistributedRateLimiter>,
    local: Arc<LocalRateLimiter>,
    events: EventEmitter,
    health: RwLock<HealthStatus>,
}

impl RateLimiter {
    /// Build a facade that starts HEALTHY on `distributed`.
    pub fn new(
        resolver: Arc<PolicyResolver>,
        distributed: DistributedRateLimiter,
        local: Arc<LocalRateLimiter>,
        events: EventEmitter,
    ) -> Self {
        Self::build(resolver, Some(distributed), local, events)
    }

    /// Build a facade with no shared store; every decision is local.
    pub fn local_only(
        resolver: Arc<PolicyResolver>,
        local: Arc<LocalRateLimiter>,
        events: EventEmitter,
    ) -> Self {
        Self::build(resolver, None, local, events)
    }

    fn build(
        resolver: Arc<PolicyResolver>,
        distributed: Option<DistributedRateLimiter>,
        local: Arc<LocalRateLimiter>,
        events: EventEmitter,
    ) -> Self {
        let state = if distributed.is_some() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        Self {
            health: RwLock::new(HealthStatus {
                state,
                since: Utc::now(),
                failovers: 0,
                store_configured: distributed.is_some(),
            }),
            resolver,
            distributed,
            local,
            events,
        }
    }

    /// Decide whether one request may proceed.
    pub async fn evaluate(&self, input: &SubjectInput) -> RateLimitDecision {
        let started = Instant::now();

        let policy = self.resolver.resolve(
            input.principal_tier,
            input.service_tag.as_deref(),
            input.endpoint_tag.as_deref(),
        );
        let subject = input.subject();
        let cost = policy.effective_cost(input.cost_hint());

        let decision = match &self.distributed {
            Some(distributed) if self.state() == HealthState::Healthy => {
                match distributed.check(&subject, &policy, cost).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        self.mark_degraded(&e);
                        self.local.check(&subject, &policy, cost)
                    }
                }
            }
            _ => self.local.check(&subject, &policy, cost),
        };

        if !decision.allowed {
            debug!(
                subject = %subject,
                policy = policy.name(),
                scope = %decision.scope,
                backend = %decision.backend,
                "Request rate limited"
            );
        }

        self.events.emit(UsageEvent::decision(
            &subject,
            policy.name(),
            &decision,
            started.elapsed(),
        ));

        decision
    }

    fn mark_degraded(&self, error: &StoreError) {
        {
            let mut health = self.health.write();
            if health.state == HealthState::Degraded {
                return;
            }
            health.state = HealthState::Degraded;
            health.since = Utc::now();
            health.failovers += 1;
        }

        warn!(error = %error, "Counter store failed, falling back to local rate limiting");
        self.events
            .emit(UsageEvent::health(EventKind::StoreDegraded, error.to_string()));
    }

    fn mark_healthy(&self) {
        {
            let mut health = self.health.write();
            if health.state == HealthState::Healthy {
                return;
            }
            health.state = HealthState::Healthy;
            health.since = Utc::now();
        }

        info!("Counter store reachable again, resuming distributed rate limiting");
        self.events
            .emit(UsageEvent::health(EventKind::StoreRecovered, "probe succeeded"));
    }

    /// Run one health probe now.
    ///
    /// Only a DEGRADED facade with a configured store probes; the returned
    /// state is the one in effect afterwards.
    pub async fn probe_now(&self) -> HealthState {
        let Some(distributed) = &self.distributed else {
            return HealthState::Degraded;
        };
        if self.state() == HealthState::Healthy {
            return HealthState::Healthy;
        }

        match distributed.ping().await {
            Ok(()) => self.mark_healthy(),
            Err(e) => debug!(error = %e, "Counter store still unreachable"),
        }
        self.state()
    }

    /// Probe every `interval` (plus up to 10% jitter) until aborted.
    ///
    /// Returns `None` when no store is configured.
    pub fn spawn_health_probe(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.distributed.as_ref()?;

        let limiter = Arc::clone(self);
        let max_jitter = u64::try_from(interval.as_millis() / 10).unwrap_or(0);
        Some(tokio::spawn(async move {
            loop {
                let jitter = if max_jitter > 0 {
                    rand::thread_rng().gen_range(0..=max_jitter)
                } else {
                    0
                };
                tokio::time::sleep(interval + Duration::from_millis(jitter)).await;

                if limiter.state() == HealthState::Degraded {
                    limiter.probe_now().await;
                }
            }
        }))
    }

    pub fn state(&self) -> HealthState {
        self.health.read().state
    }

    pub fn health(&self) -> HealthStatus {
        self.health.read().clone()
    }

    pub fn resolver(&self) -> &Arc<PolicyResolver> {
        &self.resolver
    }

    pub fn local(&self) -> &Arc<LocalRateLimiter> {
        &self.local
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("distributed", &self.distributed)
            .field("health", &*self.health.read())
            .finish_non_exhaustive()
    }
}
