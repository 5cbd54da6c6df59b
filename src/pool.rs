//! Routes counter operations to the shard owning each key.

use crate::circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::error::{CounterError, CounterResult};
use crate::ring::HashRing;
use crate::store::{ClientOptions, RespClient, ShardClient};
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info};

struct ShardHandle {
    client: Arc<dyn ShardClient>,
    breaker: CircuitBreaker,
}

/// Reachability of one shard as seen by [`ShardPool::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHealth {
    pub shard: String,
    pub healthy: bool,
    pub circuit: CircuitState,
    pub error: Option<String>,
}

/// One long-lived client per shard plus the ring deciding which shard owns a key.
///
/// Membership changes keep the two in step: a shard's client is registered
/// before it joins the ring and leaves the ring before its client is dropped,
/// so a lookup never names a shard without a client unless something else
/// has gone wrong.
pub struct ShardPool {
    ring: RwLock<HashRing>,
    shards: DashMap<String, Arc<ShardHandle>>,
    breaker_settings: BreakerSettings,
}

impl ShardPool {
    /// Build a pool of RESP clients for every configured shard.
    pub fn connect(config: &Config) -> CounterResult<Self> {
        let options = ClientOptions {
            timeout: config.store.timeout(),
            password: config.shards.password.clone(),
            db: config.shards.db,
        };

        let mut clients: Vec<(String, Arc<dyn ShardClient>)> = Vec::new();
        for node in &config.shards.nodes {
            let client = RespClient::new(node, &options)?;
            clients.push((node.clone(), Arc::new(client)));
        }

        Self::from_clients(
            config.shards.virtual_nodes,
            clients,
            config.store.breaker_settings(),
        )
    }

    /// Build a pool from ready-made clients. Fails with `RingEmpty` when none are given.
    pub fn from_clients<I>(
        virtual_nodes: usize,
        clients: I,
        breaker_settings: BreakerSettings,
    ) -> CounterResult<Self>
    where
        I: IntoIterator<Item = (String, Arc<dyn ShardClient>)>,
    {
        let pool = Self {
            ring: RwLock::new(HashRing::new(virtual_nodes)),
            shards: DashMap::new(),
            breaker_settings,
        };
        for (shard, client) in clients {
            pool.add_shard(&shard, client);
        }

        if pool.is_empty() {
            return Err(CounterError::RingEmpty);
        }
        info!(
            shards = pool.shards.len(),
            virtual_nodes,
            "Shard pool ready"
        );
        Ok(pool)
    }

    /// Add a shard, or replace the client of one already present.
    pub fn add_shard(&self, shard: &str, client: Arc<dyn ShardClient>) {
        self.shards.insert(
            shard.to_string(),
            Arc::new(ShardHandle {
                client,
                breaker: CircuitBreaker::new(shard, self.breaker_settings),
            }),
        );
        self.ring
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_node(shard);
        debug!(shard, "Shard added");
    }

    /// Remove a shard. Returns false if it was not part of the pool.
    pub fn remove_shard(&self, shard: &str) -> bool {
        self.ring
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_node(shard);
        let removed = self.shards.remove(shard).is_some();
        if removed {
            debug!(shard, "Shard removed");
        }
        removed
    }

    /// Name of the shard owning `key`.
    pub fn locate(&self, key: &str) -> CounterResult<String> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .locate(key)
            .map(str::to_string)
    }

    /// Shards currently in the ring, sorted.
    pub fn shards(&self) -> Vec<String> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes()
    }

    pub fn is_empty(&self) -> bool {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn route(&self, key: &str) -> CounterResult<(String, Arc<ShardHandle>)> {
        let shard = self.locate(key)?;
        match self.handle(&shard) {
            Some(handle) => Ok((shard, handle)),
            None => {
                error!(shard = %shard, key, "Ring routed key to a shard missing from the pool");
                Err(CounterError::ShardMissingFromPool(shard))
            }
        }
    }

    // Handles are cloned out so no map guard is held across an await.
    fn handle(&self, shard: &str) -> Option<Arc<ShardHandle>> {
        self.shards.get(shard).map(|handle| Arc::clone(&handle))
    }

    /// Atomically add `amount` to `key` on its shard and return the new total.
    pub async fn increment(&self, key: &str, amount: i64) -> CounterResult<i64> {
        let (shard, handle) = self.route(key)?;
        guarded(&shard, &handle, handle.client.incr_by(key, amount)).await
    }

    /// Read `key` from its shard. A key the shard does not hold reads as 0.
    pub async fn get(&self, key: &str) -> CounterResult<i64> {
        let (shard, handle) = self.route(key)?;
        guarded(&shard, &handle, handle.client.get(key))
            .await
            .map(|value| value.unwrap_or(0))
    }

    /// Ping every shard.
    pub async fn health_check(&self) -> Vec<ShardHealth> {
        let mut report = Vec::new();
        for shard in self.shards() {
            let Some(handle) = self.handle(&shard) else {
                continue;
            };
            let result = guarded(&shard, &handle, handle.client.ping()).await;
            report.push(ShardHealth {
                circuit: handle.breaker.state().await,
                healthy: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                shard,
            });
        }
        report
    }

    pub async fn circuit_state(&self, shard: &str) -> Option<CircuitState> {
        let handle = self.handle(shard)?;
        Some(handle.breaker.state().await)
    }
}

/// Run a store operation behind the shard's circuit breaker.
async fn guarded<T, F>(shard: &str, handle: &ShardHandle, operation: F) -> CounterResult<T>
where
    F: std::future::Future<Output = CounterResult<T>>,
{
    if !handle.breaker.can_execute().await {
        return Err(CounterError::store_unavailable(shard, "circuit breaker open"));
    }

    let result = operation.await;
    match &result {
        Err(CounterError::StoreUnavailable { .. }) => handle.breaker.record_failure().await,
        // The shard answered, even if with an error
        _ => handle.breaker.record_success().await,
    }
    result
}
