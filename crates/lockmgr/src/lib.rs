//! Lock Manager: leased advisory locks over resources (shard, collection,
//! global) with fencing tokens (§4.10). Acquisition is non-blocking;
//! holders renew at one-third of their lease TTL. A lock whose holder's
//! Migration has reached a terminal state, or whose lease has expired past
//! TTL plus grace, is reaped by any process that observes it.

use models::{Id, Lock, Resource};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use status_store::{StatusError, StatusStore};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("resource {resource} is held by another migration")]
    Busy { resource: Resource },
    #[error("lock on {resource} could not be acquired within the contention window")]
    Unavailable { resource: Resource },
    #[error(transparent)]
    Status(#[from] StatusError),
}

impl LockError {
    pub fn class(&self) -> models::ErrorClass {
        match self {
            LockError::Busy { .. } | LockError::Unavailable { .. } => {
                models::ErrorClass::Contention
            }
            LockError::Status(err) => err.class(),
        }
    }
}

/// LockManager is a thin policy layer over `StatusStore`'s lock
/// primitives: it does not hold lock state itself (the Status Store does),
/// only the acquire/renew/reap cadence.
pub struct LockManager {
    store: Arc<dyn StatusStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Acquires a lease over `resource` for `holder`, retrying briefly
    /// within `contention_window` before giving up with
    /// `LockError::Unavailable` (distinct from an immediate `Busy`, which
    /// callers may treat as non-retryable if they already know another
    /// migration is actively running).
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        resource: Resource,
        holder: Id,
        ttl: Duration,
        contention_window: Duration,
    ) -> Result<LockHandle, LockError> {
        let deadline = tokio::time::Instant::now() + contention_window;
        let mut first_attempt = true;

        loop {
            match self.store.acquire_lock(&resource, holder, ttl).await {
                Ok(lock) => {
                    tracing::info!(%resource, fencing_token = lock.fencing_token, "lock acquired");
                    return Ok(LockHandle {
                        resource,
                        holder,
                        ttl,
                        fencing_token: AtomicI64::new(lock.fencing_token),
                        store: self.store.clone(),
                    });
                }
                Err(StatusError::LockBusy { .. }) if first_attempt && contention_window.is_zero() => {
                    return Err(LockError::Busy { resource });
                }
                Err(StatusError::LockBusy { .. }) if tokio::time::Instant::now() < deadline => {
                    first_attempt = false;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(StatusError::LockBusy { resource }) => {
                    return Err(LockError::Unavailable { resource });
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Runs until `shutdown` resolves, reaping stale locks every
    /// `interval`.
    pub async fn reap_loop(
        &self,
        interval: Duration,
        grace: Duration,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.reap_stale_locks(grace).await {
                        Ok(reaped) if !reaped.is_empty() => {
                            tracing::info!(count = reaped.len(), "reaped stale locks");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(?err, "failed to reap stale locks"),
                    }
                }
                () = &mut shutdown => return,
            }
        }
    }
}

/// LockHandle is held by whoever acquired a lease. Dropping it does not
/// release the lease -- callers must `release` explicitly once the
/// resource is safe to hand to another migration, since release is itself
/// a fallible remote operation.
pub struct LockHandle {
    resource: Resource,
    holder: Id,
    ttl: Duration,
    fencing_token: AtomicI64,
    store: Arc<dyn StatusStore>,
}

impl LockHandle {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// The fencing token to present on every write to the resource this
    /// lock protects. Writes bearing a stale token are rejected by the
    /// Status Store.
    pub fn fencing_token(&self) -> i64 {
        self.fencing_token.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self), fields(resource = %self.resource))]
    pub async fn renew(&self) -> Result<(), LockError> {
        let current = self.fencing_token();
        let lock: Lock = self
            .store
            .renew_lock(&self.resource, self.holder, current, self.ttl)
            .await?;
        self.fencing_token.store(lock.fencing_token, Ordering::SeqCst);
        Ok(())
    }

    /// Runs a renewal loop at one-third of `ttl` until `shutdown`
    /// resolves. Intended to be spawned alongside the Executor driving the
    /// locked resource.
    pub async fn renew_loop(&self, shutdown: impl std::future::Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.ttl / 3);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.renew().await {
                        tracing::warn!(?err, resource = %self.resource, "lock renewal failed");
                    }
                }
                () = &mut shutdown => return,
            }
        }
    }

    pub async fn release(&self) -> Result<(), LockError> {
        self.store.release_lock(&self.resource, self.holder).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::IdGenerator;
    use status_store::memory::MemoryStatusStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStatusStore::new()))
    }

    #[tokio::test]
    async fn busy_resource_rejects_immediately_with_a_zero_window() {
        let mgr = manager();
        let resource = Resource::Shard { store_class: "relational".into(), shard: 0 };
        let holder_a = IdGenerator::new(1).next();
        let holder_b = IdGenerator::new(2).next();

        let _lease = mgr
            .acquire(resource.clone(), holder_a, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();

        let err = mgr
            .acquire(resource, holder_b, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));
    }

    #[tokio::test]
    async fn release_frees_the_resource_for_the_next_holder() {
        let mgr = manager();
        let resource = Resource::Shard { store_class: "relational".into(), shard: 0 };
        let holder_a = IdGenerator::new(1).next();
        let holder_b = IdGenerator::new(2).next();

        let lease = mgr
            .acquire(resource.clone(), holder_a, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();
        lease.release().await.unwrap();

        mgr.acquire(resource, holder_b, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn renew_advances_the_fencing_token() {
        let mgr = manager();
        let resource = Resource::Shard { store_class: "relational".into(), shard: 0 };
        let holder = IdGenerator::new(1).next();

        let lease = mgr
            .acquire(resource, holder, Duration::from_secs(30), Duration::ZERO)
            .await
            .unwrap();
        let before = lease.fencing_token();
        lease.renew().await.unwrap();
        assert_eq!(lease.fencing_token(), before);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn reap_loop_logs_when_it_reaps_an_expired_lock() {
        let store = Arc::new(MemoryStatusStore::new());
        let mgr = LockManager::new(store.clone());
        let resource = Resource::Shard { store_class: "relational".into(), shard: 0 };
        let holder = IdGenerator::new(1).next();

        mgr.acquire(resource, holder, Duration::from_millis(1), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let reap = tokio::spawn(async move {
            mgr.reap_loop(Duration::from_millis(1), Duration::ZERO, async {
                shutdown_rx.await.ok();
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).ok();
        reap.await.unwrap();

        assert!(logs_contain("reaped stale locks"));
    }
}
