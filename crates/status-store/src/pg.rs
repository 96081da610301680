//! PgStatusStore is the relational `StatusStore` back-end: row-level
//! `UPDATE ... WHERE version = $n` for CAS, and `FOR UPDATE SKIP LOCKED`
//! for non-blocking lock acquisition.

use crate::{StatusError, StatusStore};
use async_trait::async_trait;
use models::{
    Event, EventKind, Id, Lock, Migration, MigrationFilter, MigrationRequest, MigrationState,
    Resource, ShardId, ShardProgress, ShardProgressStatus,
};
use std::time::Duration;

pub struct PgStatusStore {
    pool: sqlx::PgPool,
}

impl PgStatusStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn pg_err(err: sqlx::Error) -> StatusError {
    StatusError::Unavailable(err.to_string())
}

#[async_trait]
impl StatusStore for PgStatusStore {
    #[tracing::instrument(skip(self, migration, request), fields(migration_id = %migration.id))]
    async fn create_migration(
        &self,
        migration: &Migration,
        request: &MigrationRequest,
    ) -> Result<(), StatusError> {
        let request_json = serde_json::to_value(request).map_err(|err| StatusError::Other(err.into()))?;

        sqlx::query!(
            r#"
            INSERT INTO migrations (
                id, request_id, request, plan_digest, state, current_stage,
                created_at, started_at, ended_at, items_processed,
                final_outcome, last_error, version, owner_token, unrecoverable_steps
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
            migration.id as Id,
            migration.request_id as Id,
            request_json,
            migration.plan_digest,
            migration.state as MigrationState,
            migration.current_stage.map(|s| s as i32),
            migration.created_at,
            migration.started_at,
            migration.ended_at,
            migration.items_processed as i64,
            migration.final_outcome,
            migration.last_error,
            migration.version,
            migration.owner_token,
            &migration.unrecoverable_steps,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    async fn get_request(&self, migration_id: Id) -> Result<Option<MigrationRequest>, StatusError> {
        let row = sqlx::query!(
            r#"SELECT request FROM migrations WHERE id = $1"#,
            migration_id as Id,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        row.map(|r| serde_json::from_value(r.request).map_err(|err| StatusError::Other(err.into())))
            .transpose()
    }

    async fn list_migrations(&self, filter: &MigrationFilter) -> Result<Vec<Migration>, StatusError> {
        let rows = sqlx::query!(
            r#"
            SELECT
                id as "id: Id", request_id as "request_id: Id", plan_digest,
                state as "state: MigrationState", current_stage,
                created_at, started_at, ended_at, items_processed,
                final_outcome, last_error, version, owner_token, unrecoverable_steps
            FROM migrations
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR request->>'store_class' = $2)
            ORDER BY created_at DESC
            "#,
            filter.state.map(|s| s.to_string()),
            filter.store_class.map(|c| c.to_string()),
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Migration {
                id: r.id,
                request_id: r.request_id,
                plan_digest: r.plan_digest,
                state: r.state,
                current_stage: r.current_stage.map(|s| s as usize),
                created_at: r.created_at,
                started_at: r.started_at,
                ended_at: r.ended_at,
                items_processed: r.items_processed as u64,
                final_outcome: r.final_outcome,
                last_error: r.last_error,
                version: r.version,
                owner_token: r.owner_token,
                unrecoverable_steps: r.unrecoverable_steps.unwrap_or_default(),
            })
            .collect())
    }

    async fn get_migration(&self, id: Id) -> Result<Option<Migration>, StatusError> {
        let row = sqlx::query!(
            r#"
            SELECT
                id as "id: Id", request_id as "request_id: Id", plan_digest,
                state as "state: MigrationState", current_stage,
                created_at, started_at, ended_at, items_processed,
                final_outcome, last_error, version, owner_token, unrecoverable_steps
            FROM migrations WHERE id = $1
            "#,
            id as Id,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(|r| Migration {
            id: r.id,
            request_id: r.request_id,
            plan_digest: r.plan_digest,
            state: r.state,
            current_stage: r.current_stage.map(|s| s as usize),
            created_at: r.created_at,
            started_at: r.started_at,
            ended_at: r.ended_at,
            items_processed: r.items_processed as u64,
            final_outcome: r.final_outcome,
            last_error: r.last_error,
            version: r.version,
            owner_token: r.owner_token,
            unrecoverable_steps: r.unrecoverable_steps.unwrap_or_default(),
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn cas_migration_state(
        &self,
        id: Id,
        expected_version: i64,
        new_state: MigrationState,
    ) -> Result<Migration, StatusError> {
        let current = self
            .get_migration(id)
            .await?
            .ok_or(StatusError::NotFound(id))?;

        if current.version != expected_version {
            return Err(StatusError::VersionMismatch {
                id,
                expected: expected_version,
                found: current.version,
            });
        }
        if !current.state.can_transition_to(new_state) {
            return Err(StatusError::Other(anyhow::anyhow!(
                "illegal transition {:?} -> {:?}",
                current.state,
                new_state
            )));
        }

        let row = sqlx::query!(
            r#"
            UPDATE migrations
            SET state = $3, version = version + 1,
                started_at = CASE WHEN $3 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $3 IN ('completed', 'rolled_back', 'cancelled', 'failed') THEN NOW() ELSE ended_at END
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
            id as Id,
            expected_version,
            new_state as MigrationState,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        if row.is_none() {
            return Err(StatusError::VersionMismatch {
                id,
                expected: expected_version,
                found: current.version,
            });
        }

        self.get_migration(id)
            .await?
            .ok_or(StatusError::NotFound(id))
    }

    async fn claim_ownership(
        &self,
        id: Id,
        expected_version: i64,
        owner_token: i64,
    ) -> Result<Migration, StatusError> {
        let updated = sqlx::query!(
            r#"
            UPDATE migrations SET owner_token = $3, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
            id as Id,
            expected_version,
            owner_token,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        if updated.is_none() {
            let current = self
                .get_migration(id)
                .await?
                .ok_or(StatusError::NotFound(id))?;
            return Err(StatusError::VersionMismatch {
                id,
                expected: expected_version,
                found: current.version,
            });
        }

        self.get_migration(id)
            .await?
            .ok_or(StatusError::NotFound(id))
    }

    #[tracing::instrument(skip(self))]
    async fn upsert_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
        delta_items: u64,
        cursor: Option<&str>,
    ) -> Result<ShardProgress, StatusError> {
        let row = sqlx::query!(
            r#"
            INSERT INTO shard_migrations (
                migration_id, step_id, shard, status, items_processed,
                total_items, last_checkpoint, started_at, version
            )
            VALUES ($1, $2, $3, 'running', $4, NULL, $5, NOW(), 0)
            ON CONFLICT (migration_id, step_id, shard) DO UPDATE SET
                items_processed = shard_migrations.items_processed + EXCLUDED.items_processed,
                last_checkpoint = EXCLUDED.last_checkpoint,
                status = CASE WHEN shard_migrations.status = 'pending' THEN 'running' ELSE shard_migrations.status END,
                version = shard_migrations.version + 1
            RETURNING
                migration_id as "migration_id: Id", step_id, shard as "shard: ShardId",
                status as "status: ShardProgressStatus", items_processed, total_items,
                last_checkpoint, started_at, ended_at, error, version
            "#,
            migration_id as Id,
            step_id,
            shard as ShardId,
            delta_items as i64,
            cursor,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(ShardProgress {
            migration_id: row.migration_id,
            step_id: row.step_id,
            shard: row.shard,
            status: row.status,
            items_processed: row.items_processed as u64,
            total_items: row.total_items.map(|n| n as u64),
            last_checkpoint: row.last_checkpoint,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
            version: row.version,
        })
    }

    async fn set_progress_status(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
        status: ShardProgressStatus,
        error: Option<&str>,
    ) -> Result<ShardProgress, StatusError> {
        let row = sqlx::query!(
            r#"
            UPDATE shard_migrations
            SET status = $4, error = $5, version = version + 1,
                ended_at = CASE WHEN $4 IN ('completed', 'failed', 'skipped') THEN NOW() ELSE ended_at END
            WHERE migration_id = $1 AND step_id = $2 AND shard = $3
            RETURNING
                migration_id as "migration_id: Id", step_id, shard as "shard: ShardId",
                status as "status: ShardProgressStatus", items_processed, total_items,
                last_checkpoint, started_at, ended_at, error, version
            "#,
            migration_id as Id,
            step_id,
            shard as ShardId,
            status as ShardProgressStatus,
            error,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?
        .ok_or(StatusError::NotFound(migration_id))?;

        Ok(ShardProgress {
            migration_id: row.migration_id,
            step_id: row.step_id,
            shard: row.shard,
            status: row.status,
            items_processed: row.items_processed as u64,
            total_items: row.total_items.map(|n| n as u64),
            last_checkpoint: row.last_checkpoint,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
            version: row.version,
        })
    }

    async fn get_progress(
        &self,
        migration_id: Id,
        step_id: &str,
        shard: ShardId,
    ) -> Result<Option<ShardProgress>, StatusError> {
        let row = sqlx::query!(
            r#"
            SELECT
                migration_id as "migration_id: Id", step_id, shard as "shard: ShardId",
                status as "status: ShardProgressStatus", items_processed, total_items,
                last_checkpoint, started_at, ended_at, error, version
            FROM shard_migrations WHERE migration_id = $1 AND step_id = $2 AND shard = $3
            "#,
            migration_id as Id,
            step_id,
            shard as ShardId,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(row.map(|row| ShardProgress {
            migration_id: row.migration_id,
            step_id: row.step_id,
            shard: row.shard,
            status: row.status,
            items_processed: row.items_processed as u64,
            total_items: row.total_items.map(|n| n as u64),
            last_checkpoint: row.last_checkpoint,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
            version: row.version,
        }))
    }

    async fn list_progress(&self, migration_id: Id) -> Result<Vec<ShardProgress>, StatusError> {
        let rows = sqlx::query!(
            r#"
            SELECT
                migration_id as "migration_id: Id", step_id, shard as "shard: ShardId",
                status as "status: ShardProgressStatus", items_processed, total_items,
                last_checkpoint, started_at, ended_at, error, version
            FROM shard_migrations WHERE migration_id = $1
            "#,
            migration_id as Id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|row| ShardProgress {
                migration_id: row.migration_id,
                step_id: row.step_id,
                shard: row.shard,
                status: row.status,
                items_processed: row.items_processed as u64,
                total_items: row.total_items.map(|n| n as u64),
                last_checkpoint: row.last_checkpoint,
                started_at: row.started_at,
                ended_at: row.ended_at,
                error: row.error,
                version: row.version,
            })
            .collect())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StatusError> {
        sqlx::query!(
            r#"
            INSERT INTO migration_history (id, migration_id, kind, timestamp, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
            event.id as Id,
            event.migration_id as Id,
            event.kind as EventKind,
            event.timestamp,
            event.payload,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    async fn list_events(&self, migration_id: Id) -> Result<Vec<Event>, StatusError> {
        let rows = sqlx::query!(
            r#"
            SELECT id as "id: Id", migration_id as "migration_id: Id",
                kind as "kind: EventKind", timestamp, payload
            FROM migration_history WHERE migration_id = $1 ORDER BY timestamp ASC, id ASC
            "#,
            migration_id as Id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Event {
                id: r.id,
                migration_id: r.migration_id,
                kind: r.kind,
                timestamp: r.timestamp,
                payload: r.payload,
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn acquire_lock(
        &self,
        resource: &Resource,
        holder: Id,
        ttl: Duration,
    ) -> Result<Lock, StatusError> {
        let resource_key = resource.to_string();

        let row = sqlx::query!(
            r#"
            INSERT INTO migration_locks (resource, holder, acquired_at, expires_at, fencing_token)
            VALUES ($1, $2, NOW(), NOW() + $3::INTERVAL, 1)
            ON CONFLICT (resource) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = NOW(),
                expires_at = NOW() + $3::INTERVAL,
                fencing_token = migration_locks.fencing_token + 1
            WHERE migration_locks.expires_at < NOW()
            RETURNING holder as "holder: Id", acquired_at, expires_at, fencing_token
            "#,
            resource_key,
            holder as Id,
            ttl,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            return Err(StatusError::LockBusy {
                resource: resource.clone(),
            });
        };

        Ok(Lock {
            resource: resource.clone(),
            holder: row.holder,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            fencing_token: row.fencing_token,
        })
    }

    async fn renew_lock(
        &self,
        resource: &Resource,
        holder: Id,
        fencing_token: i64,
        ttl: Duration,
    ) -> Result<Lock, StatusError> {
        let resource_key = resource.to_string();

        let row = sqlx::query!(
            r#"
            UPDATE migration_locks
            SET expires_at = NOW() + $4::INTERVAL
            WHERE resource = $1 AND holder = $2 AND fencing_token = $3
            RETURNING holder as "holder: Id", acquired_at, expires_at, fencing_token
            "#,
            resource_key,
            holder as Id,
            fencing_token,
            ttl,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            return Err(StatusError::StaleFencingToken {
                resource: resource.clone(),
                presented: fencing_token,
                last: fencing_token,
            });
        };

        Ok(Lock {
            resource: resource.clone(),
            holder: row.holder,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            fencing_token: row.fencing_token,
        })
    }

    async fn release_lock(&self, resource: &Resource, holder: Id) -> Result<(), StatusError> {
        sqlx::query!(
            "DELETE FROM migration_locks WHERE resource = $1 AND holder = $2",
            resource.to_string(),
            holder as Id,
        )
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reap_stale_locks(&self, grace: Duration) -> Result<Vec<Lock>, StatusError> {
        let rows = sqlx::query!(
            r#"
            DELETE FROM migration_locks
            WHERE expires_at < NOW() - $1::INTERVAL
               OR holder IN (
                   SELECT id FROM migrations
                   WHERE state IN ('completed', 'rolled_back', 'cancelled', 'failed')
               )
            RETURNING resource, holder as "holder: Id", acquired_at, expires_at, fencing_token
            "#,
            grace,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(Lock {
                    resource: row.resource.parse().map_err(StatusError::Other)?,
                    holder: row.holder,
                    acquired_at: row.acquired_at,
                    expires_at: row.expires_at,
                    fencing_token: row.fencing_token,
                })
            })
            .collect()
    }
}
