use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{EventError, EventKind, EventSink, UsageEvent};

/// Writes each event as one structured log line under the `hivegate::usage`
/// target. Allowed decisions are logged at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: UsageEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(&event)?;
        match event.kind {
            EventKind::Allowed => {
                debug!(target: "hivegate::usage", kind = "allowed", event = %payload)
            }
            EventKind::Rejected => {
                info!(target: "hivegate::usage", kind = "rejected", event = %payload)
            }
            EventKind::StoreDegraded => {
                info!(target: "hivegate::usage", kind = "store_degraded", event = %payload)
            }
            EventKind::StoreRecovered => {
                info!(target: "hivegate::usage", kind = "store_recovered", event = %payload)
            }
        }
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<UsageEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: UsageEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: UsageEvent) -> Result<(), EventError> {
        Ok(())
    }
}
