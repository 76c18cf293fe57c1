// Typed adapter over the external key/value store.
//
// All cross-node atomicity is delegated to the store itself; this crate only
// maps a narrow command surface onto it and keeps failures inside `StoreError`
// so callers can decide how to degrade.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;

use hearth_common::StateSnapshot;

pub mod keys;
pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Single failure kind at the store boundary. The cause is carried for
/// logging; callers never see the underlying client error type.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// One entry of an atomic multi-command group.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Set { key: String, value: String },
    IncrBy { key: String, delta: i64 },
    SortedAdd { key: String, score: f64, member: String },
    SortedRemoveByScore { key: String, min: f64, max: f64 },
}

/// Narrow surface the rest of the system is written against.
///
/// Counters are integers-as-strings in the store; `get_int` tolerates both a
/// missing key and a non-numeric value by returning `None` (the latter logs a
/// warning), so callers supply their own zero default.
#[async_trait]
pub trait StateStore: Debug + Send + Sync {
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn get_int(&self, key: &str) -> Result<Option<i64>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns true when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn sorted_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn sorted_remove_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    /// Apply a group of writes as one atomic unit.
    async fn atomic(&self, ops: &[WriteOp]) -> Result<()>;

    /// Cluster-wide fan-out. Every subscriber on `channel` receives every
    /// published payload exactly once, including subscribers on the
    /// publishing node.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>>;
}

/// Startup contract: seed the integer counters with "0" only when absent.
/// Read-then-set is fine here because startup happens before traffic.
pub async fn initialize_counters(store: &dyn StateStore) -> Result<()> {
    for key in [
        keys::CONCURRENT_CONNECTIONS,
        keys::TOTAL_CONNECTION_SECONDS,
        keys::PEAK_CONNECTIONS,
    ] {
        if store.get_int(key).await?.is_none() {
            store.set(key, "0").await?;
            tracing::info!(key, "seeded counter");
        }
    }
    Ok(())
}

/// Read the three global counters, defaulting each to zero when absent.
pub async fn load_snapshot(store: &dyn StateStore) -> Result<StateSnapshot> {
    let concurrent = store
        .get_int(keys::CONCURRENT_CONNECTIONS)
        .await?
        .unwrap_or(0)
        .max(0) as u64;
    let total = store
        .get_int(keys::TOTAL_CONNECTION_SECONDS)
        .await?
        .unwrap_or(0)
        .max(0) as u64;
    let peak = store.get_int(keys::PEAK_CONNECTIONS).await?.unwrap_or(0).max(0) as u64;
    Ok(StateSnapshot {
        concurrent_connections: concurrent,
        total_connection_seconds: total,
        peak_connections: peak,
    })
}
