use crate::buffer::FlushReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Number of stripes behind the increment counter.
/// 64 stripes of 8 bytes keep the counter at 512 bytes.
const COUNTER_STRIPES: usize = 64;

/// Counter spread over several atomics so concurrent increments rarely
/// contend on the same cache line.
///
/// Writers pick a stripe round-robin through a thread-local cursor; readers
/// sum all stripes. Works in async code where tasks hop between threads since
/// only the spread matters, not thread affinity.
#[derive(Debug)]
pub struct StripedCounter {
    stripes: Vec<AtomicU64>,
}

impl StripedCounter {
    pub fn new() -> Self {
        Self {
            stripes: (0..COUNTER_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn add(&self, n: u64) {
        thread_local! {
            static CURSOR: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
        }

        let stripe = CURSOR.with(|c| {
            let val = c.get();
            c.set(val.wrapping_add(1));
            val % COUNTER_STRIPES
        });

        self.stripes[stripe].fetch_add(n, Ordering::Relaxed);
    }

    pub fn sum(&self) -> u64 {
        self.stripes
            .iter()
            .map(|stripe| stripe.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for the increment and read paths
#[derive(Debug, Default)]
pub struct CounterMetrics {
    /// Increments accepted into the write buffer
    pub increments: StripedCounter,
    /// Reads answered from the cache
    pub cache_reads: AtomicU64,
    /// Reads answered by a store round trip
    pub store_reads: AtomicU64,
    /// Reads that failed
    pub read_failures: AtomicU64,
    /// Flushes forced by a read finding the buffer stale
    pub catch_up_flushes: AtomicU64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_increment(&self, amount: u64) {
        self.increments.add(amount);
    }

    pub fn record_cache_read(&self) {
        self.cache_reads.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "read", source = "cache");
    }

    pub fn record_store_read(&self) {
        self.store_reads.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "read", source = "store");
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_catch_up_flush(&self) {
        self.catch_up_flushes.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "catch_up_flush");
    }

    /// Share of successful reads served from cache, as a percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let cache = self.cache_reads.load(Ordering::Relaxed);
        let store = self.store_reads.load(Ordering::Relaxed);
        let total = cache + store;
        if total == 0 {
            return 0.0;
        }
        (cache as f64 / total as f64) * 100.0
    }

    pub fn log_summary(&self) {
        info!(
            operation = "counter_metrics_summary",
            increments = self.increments.sum(),
            cache_reads = self.cache_reads.load(Ordering::Relaxed),
            store_reads = self.store_reads.load(Ordering::Relaxed),
            read_failures = self.read_failures.load(Ordering::Relaxed),
            cache_hit_rate_pct = self.cache_hit_rate(),
            catch_up_flushes = self.catch_up_flushes.load(Ordering::Relaxed),
        );
    }
}

/// Metrics for write-buffer flushes
#[derive(Debug, Default)]
pub struct FlushMetrics {
    pub flushes: AtomicU64,
    pub keys_flushed: AtomicU64,
    pub increments_flushed: AtomicU64,
    pub keys_failed: AtomicU64,
    pub increments_requeued: AtomicU64,
    pub store_ops: AtomicU64,
    /// Total time spent flushing (nanoseconds)
    pub flush_latency_ns: AtomicU64,
}

impl FlushMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_flush(&self, report: &FlushReport, latency: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.keys_flushed
            .fetch_add(report.keys_flushed, Ordering::Relaxed);
        self.increments_flushed
            .fetch_add(report.increments_flushed, Ordering::Relaxed);
        self.keys_failed.fetch_add(report.keys_failed, Ordering::Relaxed);
        self.increments_requeued
            .fetch_add(report.increments_requeued, Ordering::Relaxed);
        self.store_ops.fetch_add(report.store_ops, Ordering::Relaxed);
        self.flush_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Average flush duration in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.flushes.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total_ns = self.flush_latency_ns.load(Ordering::Relaxed);
        (total_ns as f64 / count as f64) / 1_000_000.0
    }

    pub fn log_summary(&self) {
        info!(
            operation = "flush_metrics_summary",
            flushes = self.flushes.load(Ordering::Relaxed),
            keys_flushed = self.keys_flushed.load(Ordering::Relaxed),
            increments_flushed = self.increments_flushed.load(Ordering::Relaxed),
            keys_failed = self.keys_failed.load(Ordering::Relaxed),
            increments_requeued = self.increments_requeued.load(Ordering::Relaxed),
            store_ops = self.store_ops.load(Ordering::Relaxed),
            avg_flush_latency_ms = self.avg_latency_ms(),
        );
    }
}

/// Combined metrics for the service
pub struct Metrics {
    pub counter: Arc<CounterMetrics>,
    pub flush: Arc<FlushMetrics>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(CounterMetrics::new()),
            flush: Arc::new(FlushMetrics::new()),
            start_time: Instant::now(),
        }
    }

    /// Log a complete metrics summary
    pub fn log_full_summary(&self) {
        info!(
            uptime_secs = self.start_time.elapsed().as_secs_f64(),
            "=== visit-counter metrics summary ==="
        );
        self.counter.log_summary();
        self.flush.log_summary();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
