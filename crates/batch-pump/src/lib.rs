//! Batch Pump streams source records in bounded batches with adaptive
//! sizing and backpressure (§4.4). One `BatchPump` drives exactly one
//! `(migration, step, shard)`, so "at most one in-flight batch per shard"
//! falls out of single ownership rather than needing its own lock; the
//! `global` semaphore capping concurrent batches across all shards of a
//! store class is a `tokio::sync::Semaphore` the Orchestrator hands every
//! pump it creates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store_driver::{Batch, Conn, Health, StoreDriver};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds and control-loop tuning for adaptive batch sizing. Numeric
/// defaults are a reasonable starting point pending empirical tuning (see
/// the open question in §9); they are not asserted as optimal.
#[derive(Debug, Clone, Copy)]
pub struct BatchPumpConfig {
    pub min_batch: usize,
    pub max_batch: usize,
    pub initial_batch: usize,
    /// Re-evaluate the target size after this many batches.
    pub adjust_every: u32,
    /// Mean batch latency above this halves the target size.
    pub high_watermark: Duration,
    /// Mean batch latency below this, with `Health::Ok`, grows the target
    /// size by 1.5x.
    pub low_watermark: Duration,
}

impl Default for BatchPumpConfig {
    fn default() -> Self {
        Self {
            min_batch: 64,
            max_batch: 8192,
            initial_batch: 512,
            adjust_every: 8,
            high_watermark: Duration::from_millis(500),
            low_watermark: Duration::from_millis(100),
        }
    }
}

/// BatchPump drives one shard's worth of `stream_batch` calls, adapting the
/// requested size to observed latency and back-end health.
pub struct BatchPump {
    config: BatchPumpConfig,
    current_size: usize,
    recent_latencies: VecDeque<Duration>,
    concurrency: Arc<Semaphore>,
}

impl BatchPump {
    /// `concurrency` is the global semaphore capping concurrent in-flight
    /// batches across all shards of this pump's store class.
    pub fn new(config: BatchPumpConfig, concurrency: Arc<Semaphore>) -> Self {
        Self {
            current_size: config.initial_batch.clamp(config.min_batch, config.max_batch),
            config,
            recent_latencies: VecDeque::with_capacity(config.adjust_every as usize),
            concurrency,
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Pulls the next batch from `driver`, blocking for a global
    /// concurrency permit first. Adjusts the target batch size afterward
    /// based on the latency just observed and the back-end's reported
    /// health.
    #[tracing::instrument(skip(self, driver, conn))]
    pub async fn next_batch<D: StoreDriver>(
        &mut self,
        driver: &D,
        cursor: Option<&str>,
        conn: &mut Conn,
    ) -> anyhow::Result<Batch> {
        let _permit: OwnedSemaphorePermit = self.concurrency.clone().acquire_owned().await?;

        let health = driver.health(conn).await?;
        if health == Health::Down {
            anyhow::bail!("store back-end is down");
        }

        let started = Instant::now();
        let batch = driver
            .stream_batch(cursor, self.current_size, conn)
            .await?;
        let elapsed = started.elapsed();

        self.observe(elapsed, health);
        Ok(batch)
    }

    fn observe(&mut self, elapsed: Duration, health: Health) {
        self.recent_latencies.push_back(elapsed);
        while self.recent_latencies.len() > self.config.adjust_every as usize {
            self.recent_latencies.pop_front();
        }

        if health == Health::Degraded {
            self.shrink();
            return;
        }

        if self.recent_latencies.len() < self.config.adjust_every as usize {
            return; // Not enough samples yet to re-evaluate.
        }

        let mean = self.recent_latencies.iter().sum::<Duration>() / self.recent_latencies.len() as u32;
        self.recent_latencies.clear();

        if mean > self.config.high_watermark {
            self.shrink();
        } else if mean < self.config.low_watermark && health == Health::Ok {
            self.grow();
        }
    }

    fn shrink(&mut self) {
        let next = (self.current_size / 2).max(self.config.min_batch);
        if next != self.current_size {
            tracing::debug!(from = self.current_size, to = next, "shrinking batch size");
        }
        self.current_size = next;
    }

    fn grow(&mut self) {
        let next = ((self.current_size as f64 * 1.5) as usize).min(self.config.max_batch);
        if next != self.current_size {
            tracing::debug!(from = self.current_size, to = next, "growing batch size");
        }
        self.current_size = next;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::ShardId;
    use store_driver::memory::MemoryDriver;

    fn config() -> BatchPumpConfig {
        BatchPumpConfig {
            min_batch: 2,
            max_batch: 32,
            initial_batch: 4,
            adjust_every: 2,
            high_watermark: Duration::from_secs(10), // effectively unreachable in-memory
            low_watermark: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn grows_on_sustained_low_latency_and_healthy_backend() {
        let driver = MemoryDriver::new();
        driver.seed(
            ShardId(0),
            (0..100).map(|i| (format!("{i:04}"), serde_json::json!(i))),
        );
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        let sem = Arc::new(Semaphore::new(4));
        let mut pump = BatchPump::new(config(), sem);
        assert_eq!(pump.current_size(), 4);

        let mut cursor = None;
        for _ in 0..2 {
            let batch = pump.next_batch(&driver, cursor.as_deref(), &mut conn).await.unwrap();
            cursor = batch.next_cursor;
        }

        assert_eq!(pump.current_size(), 6); // 4 * 1.5
    }

    #[tokio::test]
    async fn shrinks_immediately_on_degraded_health() {
        let driver = MemoryDriver::new();
        driver.set_health(ShardId(0), Health::Degraded);
        driver.seed(ShardId(0), vec![("a".to_string(), serde_json::json!(1))]);
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        let sem = Arc::new(Semaphore::new(4));
        let mut pump = BatchPump::new(config(), sem);

        pump.next_batch(&driver, None, &mut conn).await.unwrap();
        assert_eq!(pump.current_size(), 2); // 4 / 2, floored at min_batch
    }

    #[tokio::test]
    async fn refuses_to_pump_against_a_down_backend() {
        let driver = MemoryDriver::new();
        driver.set_health(ShardId(0), Health::Down);
        let mut conn = driver.open(ShardId(0)).await.unwrap();

        let sem = Arc::new(Semaphore::new(1));
        let mut pump = BatchPump::new(config(), sem);

        let err = pump.next_batch(&driver, None, &mut conn).await.unwrap_err();
        assert!(err.to_string().contains("down"));
    }

    #[quickcheck_macros::quickcheck]
    fn current_size_never_leaves_its_bounds(observations: Vec<(u16, bool)>) -> bool {
        let cfg = config();
        let mut pump = BatchPump::new(cfg, Arc::new(Semaphore::new(1)));
        for (latency_ms, degraded) in observations {
            let health = if degraded { Health::Degraded } else { Health::Ok };
            pump.observe(Duration::from_millis(latency_ms as u64), health);
            if pump.current_size < cfg.min_batch || pump.current_size > cfg.max_batch {
                return false;
            }
        }
        true
    }
}
