pub mod buffer;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod ring;
pub mod service;
pub mod store;

pub use buffer::{FlushReport, FlushWorker, WriteBuffer};
pub use cache::{Cache, CacheStats};
pub use circuit_breaker::{BreakerSettings, CircuitState};
pub use config::{CliArgs, Config};
pub use error::{CounterError, CounterResult};
pub use metrics::Metrics;
pub use pool::{ShardHealth, ShardPool};
pub use ring::HashRing;
pub use service::{page_key, CountReading, CounterService, ReadSource, ServiceSettings};
pub use store::{MemoryStore, RespClient, ShardClient};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Record `count` visits of `page` and return the resulting count.
pub async fn record_visits(config: &Config, page: &str, count: u64) -> Result<CountReading> {
    let key = page_key(page)?;
    let service = CounterService::connect(config).context("Failed to set up shard pool")?;

    service.increment_by(&key, count);
    let report = service.flush().await;
    if !report.is_complete() {
        anyhow::bail!(
            "{} visit(s) of '{}' could not be written to shard {}",
            report.increments_requeued,
            page,
            service.locate(&key)?
        );
    }

    let reading = service
        .get_count(&key)
        .await
        .with_context(|| format!("Failed to read count of '{}'", page))?;
    service.shutdown().await;
    Ok(reading)
}

pub async fn show_count(config: &Config, page: &str) -> Result<CountReading> {
    let service = CounterService::connect(config).context("Failed to set up shard pool")?;
    service
        .visit_count(page)
        .await
        .with_context(|| format!("Failed to read count of '{}'", page))
}

/// Where a page's counter lives.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Placement {
    pub page: String,
    pub key: String,
    pub shard: String,
}

/// Resolve pages to shards without contacting any of them.
pub fn locate(config: &Config, pages: &[String]) -> Result<Vec<Placement>> {
    let ring = HashRing::with_nodes(&config.shards.nodes, config.shards.virtual_nodes);
    pages
        .iter()
        .map(|page| {
            let key = page_key(page)?;
            let shard = ring.locate(&key)?.to_string();
            Ok(Placement {
                page: page.clone(),
                key,
                shard,
            })
        })
        .collect()
}

pub async fn health(config: &Config) -> Result<Vec<ShardHealth>> {
    let service = CounterService::connect(config).context("Failed to set up shard pool")?;
    Ok(service.health_check().await)
}

/// Totals for one `ingest` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: u64,
    pub rejected: u64,
    pub final_flush: FlushReport,
}

/// Record one visit per line of `input` until EOF or Ctrl-C, flushing on the
/// configured interval, then drain the buffer.
pub async fn ingest<R>(config: &Config, input: R) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    tracing::info!(operation = "startup", message = "visit-counter ingest starting");
    let service = CounterService::connect(config).context("Failed to set up shard pool")?;
    service.start();

    let mut summary = IngestSummary::default();
    let mut lines = input.lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, draining buffered visits");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                let page = line.trim();
                if page.is_empty() {
                    continue;
                }
                match service.record_visit(page) {
                    Ok(()) => summary.accepted += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping input line");
                        summary.rejected += 1;
                    }
                }
            }
        }
    }

    summary.final_flush = service.shutdown().await;
    Ok(summary)
}
