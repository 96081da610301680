//! In-memory `EventBus` used by tests. Preserves publish order per
//! migration id (the "ordered per-migration-id key" guarantee in §4.9) by
//! appending to a per-key queue rather than a single global one.

use crate::{Command, EventBus};
use async_trait::async_trait;
use models::{Event, Id};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<BTreeMap<Id, Vec<Event>>>,
    inbound: Mutex<VecDeque<Command>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_command(&self, command: Command) {
        self.inbound.lock().unwrap().push_back(command);
    }

    pub fn published_for(&self, migration_id: Id) -> Vec<Event> {
        self.published
            .lock()
            .unwrap()
            .get(&migration_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap()
            .entry(event.migration_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn recv_command(&self) -> anyhow::Result<Option<Command>> {
        Ok(self.inbound.lock().unwrap().pop_front())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::EventKind;

    fn event(migration_id: Id, kind: EventKind) -> Event {
        Event {
            id: models::IdGenerator::new(1).next(),
            migration_id,
            kind,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn publishes_preserve_order_per_migration_id() {
        let bus = MemoryBus::new();
        let migration_id = models::IdGenerator::new(1).next();

        bus.publish(&event(migration_id, EventKind::Created)).await.unwrap();
        bus.publish(&event(migration_id, EventKind::Started)).await.unwrap();

        let published = bus.published_for(migration_id);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].kind, EventKind::Created);
        assert_eq!(published[1].kind, EventKind::Started);
    }

    #[tokio::test]
    async fn commands_are_consumed_fifo() {
        let bus = MemoryBus::new();
        let migration_id = models::IdGenerator::new(1).next();
        bus.push_command(Command::Cancel { migration_id });

        let command = bus.recv_command().await.unwrap().unwrap();
        assert!(matches!(command, Command::Cancel { .. }));
        assert!(bus.recv_command().await.unwrap().is_none());
    }
}
