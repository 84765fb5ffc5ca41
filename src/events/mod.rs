//! Usage events published to an external monitoring collaborator.
//!
//! Publication is fire-and-forget: [`EventEmitter::emit`] never waits and
//! never fails. Events go through a bounded channel to a worker task that
//! hands them to an [`EventSink`]; a full channel drops the event and counts
//! it.

mod sinks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ratelimit::{LimiterBackend, RateLimitDecision, RateLimitSubject, RejectionReason};

pub use sinks::{LogSink, MemorySink, NullSink};

/// Default capacity of the emitter channel.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Allowed,
    Rejected,
    StoreDegraded,
    StoreRecovered,
}

/// One structured usage event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<RateLimitSubject>,
    /// Name of the policy that produced the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<LimiterBackend>,
    /// Evaluation latency in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    /// Free-form detail, e.g. the store error behind a degradation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    /// An allowed or rejected decision.
    pub fn decision(
        subject: &RateLimitSubject,
        policy: &str,
        decision: &RateLimitDecision,
        latency: Duration,
    ) -> Self {
        Self {
            kind: if decision.allowed {
                EventKind::Allowed
            } else {
                EventKind::Rejected
            },
            subject: Some(subject.clone()),
            policy: Some(policy.to_string()),
            scope: Some(decision.scope.to_string()),
            limit: Some(decision.limit),
            remaining: Some(decision.remaining),
            retry_after_seconds: decision.retry_after_seconds,
            reason: decision.reason,
            backend: Some(decision.backend),
            latency_us: Some(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX)),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// A change of store health.
    pub fn health(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            subject: None,
            policy: None,
            scope: None,
            limit: None,
            remaining: None,
            retry_after_seconds: None,
            reason: None,
            backend: None,
            latency_us: None,
            detail: Some(detail.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink rejected event: {0}")]
    Sink(String),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for usage events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: UsageEvent) -> Result<(), EventError>;
}

/// Non-blocking front end to an [`EventSink`].
///
/// Cloning is cheap; clones share the channel and the drop counter.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<UsageEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    /// Spawn the delivery worker. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind;
                if let Err(e) = sink.publish(event).await {
                    warn!(kind = ?kind, error = %e, "Dropped usage event after sink failure");
                }
            }
        });

        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: UsageEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Scope, Window};

    fn decision(allowed: bool) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            remaining: 0,
            limit: 60,
            scope: Scope::Window(Window::Minute),
            reset_at: Utc::now(),
            retry_after_seconds: (!allowed).then_some(12),
            reason: (!allowed).then_some(RejectionReason::WindowExceeded),
            backend: LimiterBackend::Local,
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: UsageEvent) -> Result<(), EventError> {
            Err(EventError::Sink("collector offline".to_string()))
        }
    }

    /// Never finishes publishing, so the channel fills up.
    struct StuckSink;

    #[async_trait]
    impl EventSink for StuckSink {
        async fn publish(&self, _event: UsageEvent) -> Result<(), EventError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_event_from_decision() {
        let subject = RateLimitSubject::new("user-1", Some("ai"), None);
        let event = UsageEvent::decision(
            &subject,
            "tier:user",
            &decision(false),
            Duration::from_micros(250),
        );

        assert_eq!(event.kind, EventKind::Rejected);
        assert_eq!(event.scope.as_deref(), Some("minute"));
        assert_eq!(event.latency_us, Some(250));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["reason"], "window_exceeded");
        assert_eq!(json["subject"]["principal_id"], "user-1");
        assert!(json.get("detail").is_none());
    }

    #[tokio::test]
    async fn test_emitter_delivers_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let emitter = EventEmitter::spawn(sink.clone(), 16);

        emitter.emit(UsageEvent::health(EventKind::StoreDegraded, "timeout"));
        emitter.emit(UsageEvent::health(EventKind::StoreRecovered, "ping ok"));

        for _ in 0..100 {
            if sink.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let kinds: Vec<_> = sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::StoreDegraded, EventKind::StoreRecovered]);
        assert_eq!(emitter.dropped(), 0);
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let emitter = EventEmitter::spawn(Arc::new(FailingSink), 4);
        emitter.emit(UsageEvent::health(EventKind::StoreDegraded, "timeout"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(emitter.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let emitter = EventEmitter::spawn(Arc::new(StuckSink), 1);

        for _ in 0..10 {
            emitter.emit(UsageEvent::health(EventKind::StoreDegraded, "timeout"));
        }
        // At most one event in the worker and one in the channel.
        assert!(emitter.dropped() >= 8);
    }

    #[test]
    fn test_disabled_emitter() {
        let emitter = EventEmitter::disabled();
        emitter.emit(UsageEvent::health(EventKind::StoreDegraded, "timeout"));
        assert!(!emitter.is_enabled());
        assert_eq!(emitter.dropped(), 0);
    }
}
