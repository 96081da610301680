//! An in-memory `StatusStore` used by tests across the workspace, mirroring
//! `store_driver::memory::MemoryDriver`: the same CAS, fencing, and
//! terminal-state-reaping semantics as `pg::PgStatusStore`, without a
//! database.

use crate::{StatusError, StatusStore};
use async_trait::async_trait;
use models::{
    Event, Id, Lock, Migration, MigrationFilter, MigrationRequest, MigrationState, Resource,
    ShardId, ShardProgress, ShardProgressStatus,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    migrations: BTreeMap<Id, Migration>,
    requests: BTreeMap<Id, MigrationRequest>,
    progress: BTreeMap<(Id, String, ShardId), ShardProgress>,
    events: Vec<Event>,
    locks: BTreeMap<Resource, Lock>,
}

#[derive(Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Inner>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create_migration(
        &self,
        migration: &Migration,
        request: &MigrationRequest,
    ) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.migrations.insert(migration.id, migration.clone());
        inner.requests.insert(migration.id, request.clone());
        Ok(())
    }

    async fn get_migration(&self, id: Id) -> Result<Option<Migration>, StatusError> {
        Ok(self.inner.lock().unwrap().migrations.get(&id).cloned())
    }

    async fn get_request(&self, migration_id: Id) -> Result<Option<MigrationRequest>, StatusError> {
        Ok(self.inner.lock().unwrap().requests.get(&migration_id).cloned())
    }

    async fn list_migrations(&self, filter: &MigrationFilter) -> Result<Vec<Migration>, StatusError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Migration> = inner
            .migrations
            .values()
            .filter(|m| filter.state.map_or(true, |s| s == m.state))
            .filter(|m| {
                filter.store_class.map_or(true, |class| {
                    inner
                        .requests
                        .get(&m.id)
                        .map_or(false, |r| r.store_class == class)
                })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn cas_migration_state(
        &self,
        id: Id,
        expected_version: i64,
        new_state: MigrationState,
    ) -> Result<Migration, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let migration = inner.migrations.get_mut(&id).ok_or(StatusError::NotFound(id))?;
        if migration.version != expected_version {
            return Err(StatusError::VersionMismatch {
                id,
                expected: expected_version,
                found: migration.version,
            });
        }
        if !migration.state.can_transition_to(new_state) {
            return Err(StatusError::Other(anyhow::anyhow!(
                "illegal transition {:?} -> {:?}",
                migration.state,
                new_state
            )));
        }
        migration.state = new_state;
        migration.version += 1;
        if new_state == MigrationState::Running && migration.started_at.is_none() {
            migration.started_at = Some(chrono::Utc::now());
        }
        if new_state.is_terminal() {
            migration.ended_at = Some(chrono::Utc::now());
        }
        Ok(migration.clone())
    }

    async fn claim_ownership(
        &self,
        id: Id,
        expected_version: i64,
        owner_token: i64,
    ) -> Result<Migration, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let migration = inner.migrations.get_mut(&id).ok_or(StatusError::NotFound(id))?;
        if migration.version != expected_version {
            return Err(StatusError::VersionMismatch {
                id,
                expected: expected_version,
                found: migration.version,
            });
        }
        migration.owner_token = owner_token;
        migration.version += 1;
        Ok(migration.clone())
    }

    async fn upsert_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
        delta_items: u64,
        cursor: Option<&str>,
    ) -> Result<ShardProgress, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (migration_id, step_id.to_string(), shard);
        let entry = inner.progress.entry(key).or_insert_with(|| ShardProgress {
            migration_id,
            step_id: step_id.to_string(),
            shard,
            status: ShardProgressStatus::Running,
            items_processed: 0,
            total_items: None,
            last_checkpoint: None,
            started_at: Some(chrono::Utc::now()),
            ended_at: None,
            error: None,
            version: 0,
        });
        if entry.status == ShardProgressStatus::Pending {
            entry.status = ShardProgressStatus::Running;
        }
        entry.items_processed += delta_items;
        entry.last_checkpoint = cursor.map(str::to_string);
        entry.version += 1;
        Ok(entry.clone())
    }

    async fn set_progress_status(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
        status: ShardProgressStatus,
        error: Option<&str>,
    ) -> Result<ShardProgress, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (migration_id, step_id.to_string(), shard);
        let entry = inner.progress.entry(key).or_insert_with(|| ShardProgress {
            migration_id,
            step_id: step_id.to_string(),
            shard,
            status,
            items_processed: 0,
            total_items: None,
            last_checkpoint: None,
            started_at: Some(chrono::Utc::now()),
            ended_at: None,
            error: None,
            version: 0,
        });
        entry.status = status;
        entry.error = error.map(str::to_string);
        if matches!(
            status,
            ShardProgressStatus::Completed | ShardProgressStatus::Failed | ShardProgressStatus::Skipped
        ) {
            entry.ended_at = Some(chrono::Utc::now());
        }
        entry.version += 1;
        Ok(entry.clone())
    }

    async fn get_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
    ) -> Result<Option<ShardProgress>, StatusError> {
        let key = (migration_id, step_id.to_string(), shard);
        Ok(self.inner.lock().unwrap().progress.get(&key).cloned())
    }

    async fn list_progress(&self, migration_id: Id) -> Result<Vec<ShardProgress>, StatusError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .progress
            .values()
            .filter(|p| p.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        inner.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, migration_id: Id) -> Result<Vec<Event>, StatusError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn acquire_lock(&self, resource: &Resource, holder: Id, ttl: Duration) -> Result<Lock, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let now = chrono::Utc::now();
        if let Some(existing) = inner.locks.get(resource) {
            if existing.expires_at > now {
                return Err(StatusError::LockBusy {
                    resource: resource.clone(),
                });
            }
        }
        let fencing_token = inner.locks.get(resource).map(|l| l.fencing_token + 1).unwrap_or(1);
        let lock = Lock {
            resource: resource.clone(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap(),
            fencing_token,
        };
        inner.locks.insert(resource.clone(), lock.clone());
        Ok(lock)
    }

    async fn renew_lock(
        &self,
        resource: &Resource,
        holder: Id,
        fencing_token: i64,
        ttl: Duration,
    ) -> Result<Lock, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .locks
            .get(resource)
            .cloned()
            .ok_or_else(|| StatusError::StaleFencingToken {
                resource: resource.clone(),
                presented: fencing_token,
                last: 0,
            })?;
        if existing.holder != holder || existing.fencing_token != fencing_token {
            return Err(StatusError::StaleFencingToken {
                resource: resource.clone(),
                presented: fencing_token,
                last: existing.fencing_token,
            });
        }
        let mut renewed = existing;
        renewed.expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap();
        inner.locks.insert(resource.clone(), renewed.clone());
        Ok(renewed)
    }

    async fn release_lock(&self, resource: &Resource, holder: Id) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let held_by_caller = inner.locks.get(resource).is_some_and(|l| l.holder == holder);
        if held_by_caller {
            inner.locks.remove(resource);
        }
        Ok(())
    }

    async fn reap_stale_locks(&self, grace: Duration) -> Result<Vec<Lock>, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let now = chrono::Utc::now();
        let grace = chrono::Duration::from_std(grace).unwrap();

        let terminal_holders: Vec<Id> = inner
            .migrations
            .values()
            .filter(|m| m.state.is_terminal())
            .map(|m| m.id)
            .collect();

        let (reaped, kept): (Vec<_>, Vec<_>) = inner
            .locks
            .clone()
            .into_iter()
            .partition(|(_, lock)| lock.expires_at + grace < now || terminal_holders.contains(&lock.holder));

        inner.locks = kept.into_iter().collect();
        Ok(reaped.into_iter().map(|(_, lock)| lock).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{IdGenerator, RollbackPolicy, StoreClass};

    fn sample_request(request_id: Id) -> MigrationRequest {
        MigrationRequest {
            request_id,
            name: "rename_column".into(),
            store_class: StoreClass::Relational,
            steps: Vec::new(),
            depends_on: Vec::new(),
            concurrency_hint: Default::default(),
            idempotency_key: "key-1".into(),
            rollback_policy: RollbackPolicy::Halt,
            cross_shard_probes: Vec::new(),
        }
    }

    fn sample_migration(id: Id, request_id: Id) -> Migration {
        Migration {
            id,
            request_id,
            plan_digest: None,
            state: MigrationState::Created,
            current_stage: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            items_processed: 0,
            final_outcome: None,
            last_error: None,
            version: 0,
            owner_token: 0,
            unrecoverable_steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStatusStore::new();
        let id = IdGenerator::new(1).next();
        store
            .create_migration(&sample_migration(id, id), &sample_request(id))
            .await
            .unwrap();

        store
            .cas_migration_state(id, 0, MigrationState::Planning)
            .await
            .unwrap();

        let err = store
            .cas_migration_state(id, 0, MigrationState::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn lock_busy_until_expiry() {
        let store = MemoryStatusStore::new();
        let resource = Resource::Shard {
            store_class: "relational".into(),
            shard: 0,
        };
        let holder_a = IdGenerator::new(1).next();
        let holder_b = IdGenerator::new(2).next();

        store.acquire_lock(&resource, holder_a, Duration::from_secs(30)).await.unwrap();
        let err = store
            .acquire_lock(&resource, holder_b, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::LockBusy { .. }));

        store.release_lock(&resource, holder_a).await.unwrap();
        store.acquire_lock(&resource, holder_b, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn get_request_round_trips() {
        let store = MemoryStatusStore::new();
        let id = IdGenerator::new(1).next();
        store
            .create_migration(&sample_migration(id, id), &sample_request(id))
            .await
            .unwrap();

        let fetched = store.get_request(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "rename_column");
    }
}
