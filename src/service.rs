//! The visit counter: buffered increments, cached reads, sharded storage.

use crate::buffer::{FlushReport, FlushWorker, WriteBuffer};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{CounterError, CounterResult};
use crate::metrics::Metrics;
use crate::pool::{ShardHealth, ShardPool};
use crate::store::ShardClient;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a count was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReadSource {
    Cache,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountReading {
    pub value: i64,
    pub source: ReadSource,
}

/// Counter key for a page, `page:{page_id}:visits`.
///
/// Page ids must be non-empty and free of whitespace and control characters.
pub fn page_key(page_id: &str) -> CounterResult<String> {
    if page_id.is_empty() {
        return Err(CounterError::InvalidArgument(
            "Page id cannot be empty".to_string(),
        ));
    }
    if page_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(CounterError::InvalidArgument(format!(
            "Page id {:?} contains whitespace or control characters",
            page_id
        )));
    }
    Ok(format!("page:{}:visits", page_id))
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub cache_ttl: Duration,
    pub flush_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache.ttl(),
            flush_interval: config.buffer.flush_interval(),
            shutdown_grace: config.buffer.shutdown_grace(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct CounterService {
    pool: Arc<ShardPool>,
    cache: Arc<Cache>,
    buffer: Arc<WriteBuffer>,
    metrics: Arc<Metrics>,
    settings: ServiceSettings,
    worker: Mutex<Option<FlushWorker>>,
}

impl CounterService {
    /// Build a service backed by the shards named in `config`.
    ///
    /// No shard is contacted until the first operation.
    pub fn connect(config: &Config) -> CounterResult<Self> {
        let pool = ShardPool::connect(config)?;
        Ok(Self::new(
            pool,
            ServiceSettings::from_config(config),
            Arc::new(Metrics::new()),
        ))
    }

    pub fn new(pool: ShardPool, settings: ServiceSettings, metrics: Arc<Metrics>) -> Self {
        let cache = Arc::new(Cache::new(settings.cache_ttl));
        let buffer = Arc::new(WriteBuffer::new(Arc::clone(&cache), Arc::clone(&metrics)));
        Self {
            pool: Arc::new(pool),
            cache,
            buffer,
            metrics,
            settings,
            worker: Mutex::new(None),
        }
    }

    /// Start the periodic flush. Does nothing if it is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        *worker = Some(FlushWorker::spawn(
            Arc::clone(&self.buffer),
            Arc::clone(&self.pool),
            self.settings.flush_interval,
        ));
        info!(
            flush_interval_secs = self.settings.flush_interval.as_secs(),
            "Periodic flush started"
        );
    }

    /// Buffer one increment of `key`. Never touches the store.
    pub fn increment(&self, key: &str) {
        self.buffer.increment(key);
    }

    pub fn increment_by(&self, key: &str, amount: u64) {
        self.buffer.increment_by(key, amount);
    }

    /// Current total of `key`: its stored value plus everything still buffered.
    pub async fn get_count(&self, key: &str) -> CounterResult<CountReading> {
        if let Some(value) = self.cache.get(key) {
            self.metrics.counter.record_cache_read();
            return Ok(CountReading {
                value,
                source: ReadSource::Cache,
            });
        }

        if let Some(report) = self
            .buffer
            .flush_if_stale(&self.pool, self.settings.flush_interval)
            .await
        {
            debug!(
                keys_flushed = report.keys_flushed,
                keys_failed = report.keys_failed,
                "Catch-up flush before read"
            );
        }

        let result = match self.pool.locate(key) {
            Ok(shard) => {
                let _gate = self.buffer.read_gate(&shard).await;
                self.pool
                    .get(key)
                    .await
                    .map(|stored| self.buffer.settle_read(key, stored))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                self.metrics.counter.record_store_read();
                Ok(CountReading {
                    value,
                    source: ReadSource::Store,
                })
            }
            Err(e) => {
                self.metrics.counter.record_read_failure();
                warn!(key, error = %e, "Count read failed");
                Err(e)
            }
        }
    }

    pub fn record_visit(&self, page_id: &str) -> CounterResult<()> {
        self.increment(&page_key(page_id)?);
        Ok(())
    }

    pub async fn visit_count(&self, page_id: &str) -> CounterResult<CountReading> {
        self.get_count(&page_key(page_id)?).await
    }

    /// Flush the write buffer now.
    pub async fn flush(&self) -> FlushReport {
        self.buffer.flush(&self.pool).await
    }

    /// Add a shard. Keys it takes over start from whatever it stores; values
    /// left on their previous shard are not moved.
    pub fn add_shard(&self, shard: &str, client: Arc<dyn ShardClient>) {
        self.pool.add_shard(shard, client);
        self.cache.clear();
        info!(shard, "Shard joined the ring");
    }

    pub fn remove_shard(&self, shard: &str) -> bool {
        let removed = self.pool.remove_shard(shard);
        if removed {
            self.cache.clear();
            info!(shard, "Shard left the ring");
        }
        removed
    }

    pub fn locate(&self, key: &str) -> CounterResult<String> {
        self.pool.locate(key)
    }

    pub fn shards(&self) -> Vec<String> {
        self.pool.shards()
    }

    pub async fn health_check(&self) -> Vec<ShardHealth> {
        self.pool.health_check().await
    }

    /// Stop the periodic flush and drain the buffer.
    ///
    /// An in-flight flush gets the configured grace period before it is
    /// aborted; whatever it had not sent is merged back and goes out with the
    /// final flush.
    pub async fn shutdown(&self) -> FlushReport {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.stop(self.settings.shutdown_grace).await;
        }

        let report = self.buffer.flush(&self.pool).await;
        if !report.is_complete() {
            warn!(
                keys_failed = report.keys_failed,
                increments_requeued = report.increments_requeued,
                "Final flush left counts unsent"
            );
        }
        self.metrics.log_full_summary();
        report
    }

    pub fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }
}
