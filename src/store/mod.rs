//! Shared counter stores.
//!
//! A store owns the per-subject counters every server process consults. The
//! only mutation it exposes is [`CounterStore::atomic_check_and_consume`], so
//! no caller ever reads counters and writes them back in separate steps.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{GateOutcome, RateLimitPolicy, RateLimitSubject};

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Errors talking to a shared store.
///
/// Every variant means "the store cannot be trusted right now"; none of them
/// is ever read as an allow or a deny.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("unexpected store response: {0}")]
    Protocol(String),
    #[error("store is unavailable")]
    Unavailable,
}

/// Backing store for the distributed limiter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Run both gates for `subject` as one atomic unit and debit `cost`
    /// tokens if, and only if, every gate passes.
    async fn atomic_check_and_consume(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
        cost: f64,
    ) -> Result<GateOutcome, StoreError>;

    /// Cheap liveness check used by the failback probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Establish the connection if there is none yet.
    ///
    /// Implementations bound this with their own connect timeout; callers
    /// must not wrap it in the per-operation timeout.
    async fn ensure_connected(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
