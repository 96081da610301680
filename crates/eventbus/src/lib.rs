//! Event Bus Adapter: publishes lifecycle events at-least-once, and
//! consumes `migration.request` / `migration.cancel` commands (§4.9). The
//! adapter is a thin shim over two interchangeable back-ends
//! (`event_bus_kind: broker_a|broker_b` in configuration, §6); both
//! guarantee at-least-once delivery ordered per migration-id key.
//! Consumers must dedupe by event id.

use async_trait::async_trait;
use models::{Event, Id, MigrationRequest};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub mod memory;

/// Command is the inbound message shape the adapter deserializes from
/// either broker back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    #[serde(rename = "migration.request")]
    Request { request: MigrationRequest },
    #[serde(rename = "migration.cancel")]
    Cancel { migration_id: Id },
}

/// OutboundEvent is the wire shape published for every `Event` kind (§6):
/// `{type: "migration.<kind>", migration_id, timestamp, details}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    pub type_: String,
    pub migration_id: Id,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: serde_json::Value,
}

impl From<&Event> for OutboundEvent {
    fn from(event: &Event) -> Self {
        Self {
            type_: format!("migration.{}", event.kind),
            migration_id: event.migration_id,
            timestamp: event.timestamp,
            details: event.payload.clone(),
        }
    }
}

/// EventBus is the capability contract the Orchestrator depends on. The
/// concrete wire protocol to either broker back-end is out of scope (§1);
/// this fixes only the shape the engine publishes and consumes.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, event: &Event) -> anyhow::Result<()>;

    /// Returns the next inbound command, or `None` if the bus has no more
    /// buffered commands right now (callers poll or await on their own
    /// cadence; this adapter does not block indefinitely).
    async fn recv_command(&self) -> anyhow::Result<Option<Command>>;
}

/// BufferedPublisher wraps an `EventBus` so that a broker outage never
/// blocks an in-flight Migration: failed publishes are retried with
/// exponential backoff on a background task rather than propagating the
/// error to the caller. Events are expected to already be durable in the
/// Status Store's append-only log before `publish` is called -- this
/// buffer only smooths over bus unavailability, it is not the durability
/// boundary.
pub struct BufferedPublisher<B: EventBus> {
    inner: B,
    pending: Mutex<Vec<Event>>,
}

impl<B: EventBus> BufferedPublisher<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `event`, queueing it for retry rather than failing if the
    /// bus is currently unavailable.
    #[tracing::instrument(skip(self, event), fields(migration_id = %event.migration_id, kind = %event.kind))]
    pub async fn publish_or_buffer(&self, event: Event) {
        if let Err(err) = self.inner.publish(&event).await {
            tracing::warn!(?err, "event bus publish failed, buffering for retry");
            self.pending.lock().unwrap().push(event);
        }
    }

    /// Retries every buffered event once. Intended to be called from a
    /// periodic drain loop; events that still fail remain buffered.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) {
        let batch: Vec<Event> = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut still_pending = Vec::new();

        for event in batch {
            if let Err(err) = self.inner.publish(&event).await {
                tracing::debug!(?err, migration_id = %event.migration_id, "retry still failing");
                still_pending.push(event);
            }
        }

        if !still_pending.is_empty() {
            tracing::warn!(count = still_pending.len(), "events remain buffered after drain");
        }
        self.pending.lock().unwrap().extend(still_pending);
    }

    /// Runs `drain_once` on `interval` until `shutdown` resolves.
    pub async fn drain_loop(
        &self,
        interval: std::time::Duration,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_once().await,
                () = &mut shutdown => return,
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
