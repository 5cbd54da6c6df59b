use crate::error::{CounterError, CounterResult};
use crate::store::ShardClient;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-process shard keeping counters in a map.
///
/// Counts every store operation it serves and can be switched offline to
/// simulate an unreachable shard.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    values: DashMap<String, i64>,
    online: AtomicBool,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: DashMap::new(),
            online: AtomicBool::new(true),
            operations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the shard offline (every operation fails) or bring it back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of store operations served or refused so far.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Read a value directly, bypassing availability and op counting.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.values.get(key).map(|v| *v)
    }

    /// Seed a value directly.
    pub fn insert(&self, key: &str, value: i64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn key_count(&self) -> usize {
        self.values.len()
    }

    fn begin(&self) -> CounterResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CounterError::store_unavailable(&self.name, "shard offline"))
        }
    }
}

#[async_trait]
impl ShardClient for MemoryStore {
    async fn incr_by(&self, key: &str, amount: i64) -> CounterResult<i64> {
        self.begin()?;
        let mut value = self.values.entry(key.to_string()).or_insert(0);
        *value = value.checked_add(amount).ok_or_else(|| {
            CounterError::store_error(&self.name, "increment or decrement would overflow")
        })?;
        Ok(*value)
    }

    async fn get(&self, key: &str) -> CounterResult<Option<i64>> {
        self.begin()?;
        Ok(self.value(key))
    }

    async fn ping(&self) -> CounterResult<()> {
        self.begin()
    }
}
