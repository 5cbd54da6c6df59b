//! Write-coalescing buffer in front of the shard pool.
//!
//! Increments land in a per-key pending map and reach the store in batches,
//! one `INCRBY` per key per flush. A flush removes the counts it is about to
//! send; a count whose send fails, or whose outcome is lost because the flush
//! was dropped part way, is merged back so it goes out again with the next
//! flush. Delivery is therefore at-least-once.
//!
//! Each shard has a gate ordering its flush against reads of its keys: the
//! flush holds it exclusively while it takes and sends that shard's counts,
//! and a read holds it shared while it combines the stored value with the
//! pending count, so a count is never seen in both places or in neither.
//! Reads of other shards never wait on it.

use crate::cache::Cache;
use crate::metrics::Metrics;
use crate::pool::ShardPool;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default period of the background flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys whose pending count the store accepted
    pub keys_flushed: u64,
    /// Sum of the accepted counts
    pub increments_flushed: u64,
    /// Keys merged back for a later flush
    pub keys_failed: u64,
    /// Sum of the counts merged back
    pub increments_requeued: u64,
    /// Store operations attempted
    pub store_ops: u64,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.keys_flushed += other.keys_flushed;
        self.increments_flushed += other.increments_flushed;
        self.keys_failed += other.keys_failed;
        self.increments_requeued += other.increments_requeued;
        self.store_ops += other.store_ops;
    }

    /// True when nothing was left behind for a later flush.
    pub fn is_complete(&self) -> bool {
        self.keys_failed == 0
    }
}

/// Counts taken out of the pending map by a flush.
///
/// Any count still held when the batch is dropped goes back into the pending
/// map. A count is released with [`PendingBatch::settle`] once the store has
/// accepted it.
struct PendingBatch<'a> {
    pending: &'a DashMap<String, u64>,
    entries: Vec<(String, u64)>,
}

impl<'a> PendingBatch<'a> {
    fn new(pending: &'a DashMap<String, u64>) -> Self {
        Self {
            pending,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, key: String, count: u64) {
        self.entries.push((key, count));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn settle(&mut self, index: usize) {
        self.entries[index].1 = 0;
    }

    fn requeue(&mut self, index: usize) {
        let (key, count) = &mut self.entries[index];
        merge_count(self.pending, key, *count);
        *count = 0;
    }
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        let mut requeued = 0u64;
        for (key, count) in self.entries.drain(..) {
            if count > 0 {
                merge_count(self.pending, &key, count);
                requeued += count;
            }
        }
        if requeued > 0 {
            warn!(
                requeued_increments = requeued,
                "Merged unsent counts back into the buffer"
            );
        }
    }
}

fn merge_count(pending: &DashMap<String, u64>, key: &str, count: u64) {
    let mut entry = pending.entry(key.to_string()).or_insert(0);
    *entry = entry.saturating_add(count);
}

pub struct WriteBuffer {
    pending: DashMap<String, u64>,
    gates: DashMap<String, Arc<RwLock<()>>>,
    /// Serializes flushes
    flushing: Mutex<()>,
    epoch: Instant,
    /// Milliseconds from `epoch` to the start of the last flush
    last_flush_ms: AtomicU64,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
}

impl WriteBuffer {
    pub fn new(cache: Arc<Cache>, metrics: Arc<Metrics>) -> Self {
        Self {
            pending: DashMap::new(),
            gates: DashMap::new(),
            flushing: Mutex::new(()),
            epoch: Instant::now(),
            last_flush_ms: AtomicU64::new(0),
            cache,
            metrics,
        }
    }

    pub fn increment(&self, key: &str) {
        self.increment_by(key, 1);
    }

    /// Add `amount` to the pending count of `key` and drop its cached total.
    ///
    /// The cache entry is invalidated while the pending entry is still locked,
    /// so a read settling the same key cannot cache a total that misses this
    /// increment.
    pub fn increment_by(&self, key: &str, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut entry = self.pending.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(amount);
        self.cache.invalidate(key);
        drop(entry);

        self.metrics.counter.record_increment(amount);
    }

    /// Pending count of `key`, 0 when nothing is buffered.
    pub fn pending(&self, key: &str) -> u64 {
        self.pending.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Total of all pending counts.
    pub fn pending_total(&self) -> u64 {
        self.pending.iter().map(|entry| *entry.value()).sum()
    }

    /// Number of keys with a pending count.
    pub fn pending_keys(&self) -> usize {
        self.pending.iter().filter(|entry| *entry.value() > 0).count()
    }

    fn gate(&self, shard: &str) -> Arc<RwLock<()>> {
        if let Some(gate) = self.gates.get(shard) {
            return Arc::clone(gate.value());
        }
        Arc::clone(self.gates.entry(shard.to_string()).or_default().value())
    }

    /// Hold the gate of `shard` shared. No flush of that shard takes or sends
    /// counts while the guard lives.
    pub async fn read_gate(&self, shard: &str) -> OwnedRwLockReadGuard<()> {
        self.gate(shard).read_owned().await
    }

    /// Combine a stored value with the pending count of `key` and cache the
    /// result. Call with the read gate held across the store read.
    pub fn settle_read(&self, key: &str, stored: i64) -> i64 {
        let entry = self.pending.entry(key.to_string()).or_insert(0);
        let pending = *entry;
        let total = stored.saturating_add(i64::try_from(pending).unwrap_or(i64::MAX));
        self.cache.set(key, total);
        drop(entry);

        if pending == 0 {
            self.pending.remove_if(key, |_, count| *count == 0);
        }
        total
    }

    /// Time since the last flush started, or since the buffer was created.
    pub fn since_last_flush(&self) -> Duration {
        let now = self.epoch.elapsed();
        let last = Duration::from_millis(self.last_flush_ms.load(Ordering::Acquire));
        now.saturating_sub(last)
    }

    pub fn is_stale(&self, interval: Duration) -> bool {
        self.since_last_flush() > interval
    }

    fn mark_flushed(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_flush_ms.store(now, Ordering::Release);
    }

    /// Send every pending count to its shard.
    ///
    /// Waits for an in-flight flush to finish first. Shards are flushed
    /// concurrently; the keys of one shard go out one after another.
    pub async fn flush(&self, pool: &ShardPool) -> FlushReport {
        let _flushing = self.flushing.lock().await;
        self.flush_locked(pool).await
    }

    /// Flush only if no flush has started within `interval`.
    ///
    /// Returns `None` when the buffer was fresh, including when another caller
    /// flushed while this one waited its turn.
    pub async fn flush_if_stale(&self, pool: &ShardPool, interval: Duration) -> Option<FlushReport> {
        if !self.is_stale(interval) {
            return None;
        }
        let _flushing = self.flushing.lock().await;
        if !self.is_stale(interval) {
            return None;
        }
        self.metrics.counter.record_catch_up_flush();
        Some(self.flush_locked(pool).await)
    }

    async fn flush_locked(&self, pool: &ShardPool) -> FlushReport {
        let started = std::time::Instant::now();
        self.mark_flushed();

        let keys: Vec<(String, u64)> = self
            .pending
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        // Counts stay in the pending map until their shard's gate is held
        let mut report = FlushReport::default();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for (key, count) in keys {
            match pool.locate(&key) {
                Ok(shard) => groups.entry(shard).or_default().push(key),
                Err(e) => {
                    error!(key = %key, error = %e, "Cannot route buffered count");
                    report.keys_failed += 1;
                    report.increments_requeued += count;
                }
            }
        }

        let results = join_all(
            groups
                .into_iter()
                .map(|(shard, keys)| self.flush_shard(pool, shard, keys)),
        )
        .await;
        for shard_report in results {
            report.merge(shard_report);
        }

        let latency = started.elapsed();
        self.metrics.flush.record_flush(&report, latency);
        if report.store_ops == 0 && report.keys_failed == 0 {
            debug!(operation = "flush", "Nothing to flush");
        } else {
            info!(
                operation = "flush",
                keys_flushed = report.keys_flushed,
                increments_flushed = report.increments_flushed,
                keys_failed = report.keys_failed,
                increments_requeued = report.increments_requeued,
                store_ops = report.store_ops,
                latency_ms = latency.as_millis() as u64,
                "Flushed write buffer"
            );
        }
        report
    }

    async fn flush_shard(&self, pool: &ShardPool, shard: String, keys: Vec<String>) -> FlushReport {
        let gate = self.gate(&shard);
        let _gate = gate.write().await;

        let mut batch = PendingBatch::new(&self.pending);
        for key in keys {
            if let Some((key, count)) = self.pending.remove(&key) {
                if count > 0 {
                    batch.push(key, count);
                }
            }
        }
        send_batch(pool, &shard, batch).await
    }
}

async fn send_batch(pool: &ShardPool, shard: &str, mut batch: PendingBatch<'_>) -> FlushReport {
    let mut report = FlushReport::default();

    for index in 0..batch.len() {
        let (key, count) = batch.entries[index].clone();
        let Ok(amount) = i64::try_from(count) else {
            warn!(shard = %shard, key = %key, count, "Pending count exceeds store range");
            batch.requeue(index);
            report.keys_failed += 1;
            report.increments_requeued += count;
            continue;
        };

        report.store_ops += 1;
        match pool.increment(&key, amount).await {
            Ok(_) => {
                batch.settle(index);
                report.keys_flushed += 1;
                report.increments_flushed += count;
            }
            Err(e) => {
                warn!(
                    shard = %shard,
                    key = %key,
                    count,
                    error = %e,
                    "Flush of key failed, count merged back"
                );
                batch.requeue(index);
                report.keys_failed += 1;
                report.increments_requeued += count;
            }
        }
    }
    report
}

/// Background task flushing the buffer on a fixed period.
pub struct FlushWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    pub fn spawn(buffer: Arc<WriteBuffer>, pool: Arc<ShardPool>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_secs = interval.as_secs_f64(), "Flush worker started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Flush worker cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        buffer.flush(&pool).await;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the worker and wait up to `grace` for an in-flight flush.
    ///
    /// Returns false if the worker had to be aborted. An aborted flush merges
    /// its unsent counts back into the buffer.
    pub async fn stop(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Flush worker terminated abnormally");
                false
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "Flush worker did not stop within grace period, aborting"
                );
                self.handle.abort();
                let _ = (&mut self.handle).await;
                false
            }
        }
    }
}
