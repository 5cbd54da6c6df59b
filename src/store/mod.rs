//! Store contract and the clients implementing it.
//!
//! A shard is an external counter store offering an atomic add-and-return and
//! a read that reports absence. [`RespClient`] speaks the Redis protocol to a
//! real shard; [`MemoryStore`] keeps counters in-process.

pub mod client;
pub mod memory;
pub mod resp;

pub use client::{ClientOptions, RespClient, ShardAddress};
pub use memory::MemoryStore;
pub use resp::{RespError, RespReader, RespValue};

use crate::error::CounterResult;
use async_trait::async_trait;

/// Operations a single shard must provide.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Atomically add `amount` to `key` and return the new total.
    async fn incr_by(&self, key: &str, amount: i64) -> CounterResult<i64>;

    /// Read the current value of `key`, `None` when the key does not exist.
    async fn get(&self, key: &str) -> CounterResult<Option<i64>>;

    /// Round-trip a no-op to check the shard is reachable.
    async fn ping(&self) -> CounterResult<()>;
}
