//! An in-memory `StoreDriver` used by tests across the workspace. It models
//! both store classes identically: a per-shard ordered record set plus a
//! set of applied schema step names, so `apply_schema` idempotency and
//! `apply_batch` upsert-by-id semantics are exercised the same way a real
//! back-end would be.

use crate::{Batch, Conn, Health, Record, SchemaOutcome, StoreDriver};
use async_trait::async_trait;
use models::ShardId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ShardState {
    applied_schema_steps: BTreeSet<String>,
    records: BTreeMap<String, serde_json::Value>,
    health: Health,
}

pub struct MemoryConn {
    shard: ShardId,
    in_txn: bool,
}

/// MemoryDriver holds all shard state behind a single mutex, which is fine
/// for tests: the Batch Pump and Orchestrator guarantee at most one
/// in-flight batch per shard (§4.4), so contention never meaningfully
/// serializes unrelated shards.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shards: Arc<Mutex<BTreeMap<ShardId, ShardState>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `shard` with records, as if a pre-existing source dataset.
    pub fn seed(&self, shard: ShardId, records: impl IntoIterator<Item = (String, serde_json::Value)>) {
        let mut shards = self.shards.lock().unwrap();
        let state = shards.entry(shard).or_default();
        state.records.extend(records);
    }

    /// Forces the reported health of `shard`, to exercise Batch Pump
    /// backoff without needing real degraded infrastructure.
    pub fn set_health(&self, shard: ShardId, health: Health) {
        let mut shards = self.shards.lock().unwrap();
        shards.entry(shard).or_default().health = health;
    }

    pub fn record_count(&self, shard: ShardId) -> usize {
        let shards = self.shards.lock().unwrap();
        shards.get(&shard).map(|s| s.records.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    async fn open(&self, shard: ShardId) -> anyhow::Result<Conn> {
        self.shards.lock().unwrap().entry(shard).or_default();
        Ok(Conn::new(MemoryConn {
            shard,
            in_txn: false,
        }))
    }

    async fn apply_schema(&self, step: &str, conn: &mut Conn) -> anyhow::Result<SchemaOutcome> {
        let conn = conn.downcast_mut::<MemoryConn>()?;
        let mut shards = self.shards.lock().unwrap();
        let state = shards.entry(conn.shard).or_default();
        if state.applied_schema_steps.contains(step) {
            return Ok(SchemaOutcome::AlreadyApplied);
        }
        state.applied_schema_steps.insert(step.to_string());
        Ok(SchemaOutcome::Applied)
    }

    async fn stream_batch(
        &self,
        cursor: Option<&str>,
        size: usize,
        conn: &mut Conn,
    ) -> anyhow::Result<Batch> {
        let conn = conn.downcast_mut::<MemoryConn>()?;
        let shards = self.shards.lock().unwrap();
        let state = shards.get(&conn.shard).ok_or_else(|| anyhow::anyhow!("unopened shard"))?;

        let start = match cursor {
            None => std::ops::Bound::Unbounded,
            Some(after) => std::ops::Bound::Excluded(after.to_string()),
        };

        let page: Vec<Record> = state
            .records
            .range((start, std::ops::Bound::Unbounded))
            .take(size)
            .map(|(id, fields)| Record {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();

        let next_cursor = if page.len() < size {
            None
        } else {
            page.last().map(|r| r.id.clone())
        };

        Ok(Batch {
            records: page,
            next_cursor,
        })
    }

    async fn apply_batch(&self, records: Vec<Record>, conn: &mut Conn) -> anyhow::Result<usize> {
        let conn = conn.downcast_mut::<MemoryConn>()?;
        let mut shards = self.shards.lock().unwrap();
        let state = shards.entry(conn.shard).or_default();
        let n = records.len();
        for record in records {
            // Upsert-by-id: applying the same record twice is a no-op change,
            // satisfying the idempotence requirement under duplicate replay.
            state.records.insert(record.id, record.fields);
        }
        Ok(n)
    }

    async fn begin(&self, conn: &mut Conn) -> anyhow::Result<()> {
        conn.downcast_mut::<MemoryConn>()?.in_txn = true;
        Ok(())
    }

    async fn commit(&self, conn: &mut Conn) -> anyhow::Result<()> {
        conn.downcast_mut::<MemoryConn>()?.in_txn = false;
        Ok(())
    }

    async fn rollback(&self, conn: &mut Conn) -> anyhow::Result<()> {
        conn.downcast_mut::<MemoryConn>()?.in_txn = false;
        Ok(())
    }

    async fn health(&self, conn: &mut Conn) -> anyhow::Result<Health> {
        let conn = conn.downcast_mut::<MemoryConn>()?;
        let shards = self.shards.lock().unwrap();
        Ok(shards.get(&conn.shard).map(|s| s.health).unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn schema_apply_is_idempotent() {
        let driver = MemoryDriver::new();
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        assert_eq!(
            driver.apply_schema("add_column_version", &mut conn).await.unwrap(),
            SchemaOutcome::Applied
        );
        assert_eq!(
            driver.apply_schema("add_column_version", &mut conn).await.unwrap(),
            SchemaOutcome::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn duplicate_batch_apply_is_a_no_op_on_replay() {
        let driver = MemoryDriver::new();
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        let records = vec![Record {
            id: "r1".into(),
            fields: serde_json::json!({"version": 2}),
        }];

        driver.apply_batch(records.clone(), &mut conn).await.unwrap();
        driver.apply_batch(records, &mut conn).await.unwrap();

        assert_eq!(driver.record_count(ShardId(0)), 1);
    }

    #[tokio::test]
    async fn stream_batch_terminates_with_none_cursor() {
        let driver = MemoryDriver::new();
        driver.seed(
            ShardId(0),
            vec![
                ("a".to_string(), serde_json::json!(1)),
                ("b".to_string(), serde_json::json!(2)),
            ],
        );
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        let first = driver.stream_batch(None, 1, &mut conn).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert!(first.next_cursor.is_some());

        let second = driver
            .stream_batch(first.next_cursor.as_deref(), 10, &mut conn)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_cursor.is_none());
    }
}
