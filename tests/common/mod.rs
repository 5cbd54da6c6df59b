//! Common test utilities for visit-counter
//!
//! - `mock_server`: a fake RESP shard on a local TCP port
//! - memory-backed service builders for tests that do not need the wire

#![allow(dead_code)]

pub mod mock_server;

use std::sync::Arc;
use std::time::Duration;
use visit_counter::{
    BreakerSettings, CounterService, MemoryStore, Metrics, ServiceSettings, ShardClient,
    ShardPool,
};

/// Service settings with the default TTL and flush interval
pub fn test_settings() -> ServiceSettings {
    ServiceSettings {
        cache_ttl: Duration::from_secs(5),
        flush_interval: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(1),
    }
}

/// Named in-memory shards
pub fn memory_stores(count: usize) -> Vec<Arc<MemoryStore>> {
    (0..count)
        .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
        .collect()
}

/// A pool over the given in-memory shards
pub fn memory_pool(stores: &[Arc<MemoryStore>]) -> ShardPool {
    let clients = stores
        .iter()
        .map(|s| (s.name().to_string(), Arc::clone(s) as Arc<dyn ShardClient>));
    ShardPool::from_clients(100, clients, BreakerSettings::default()).unwrap()
}

/// A service over `count` in-memory shards, plus the shards themselves
pub fn memory_service(count: usize, settings: ServiceSettings) -> (CounterService, Vec<Arc<MemoryStore>>) {
    let stores = memory_stores(count);
    let service = CounterService::new(memory_pool(&stores), settings, Arc::new(Metrics::new()));
    (service, stores)
}

/// Value of `key` on whichever shard the service routes it to
pub fn stored_value(service: &CounterService, stores: &[Arc<MemoryStore>], key: &str) -> Option<i64> {
    let shard = service.locate(key).unwrap();
    stores
        .iter()
        .find(|s| s.name() == shard)
        .and_then(|s| s.value(key))
}

/// Total store operations across all shards
pub fn total_operations(stores: &[Arc<MemoryStore>]) -> u64 {
    stores.iter().map(|s| s.operation_count()).sum()
}
