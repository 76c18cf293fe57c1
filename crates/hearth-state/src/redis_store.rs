// Redis-backed store. Commands go out over a small pool of multiplexed
// connections; a connection is picked by uniform random draw per call, which
// is safe because atomicity lives server-side, not in connection affinity.
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::{Result, StateStore, StoreError, WriteOp};

const SUBSCRIBE_BUFFER: usize = 256;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct RedisStore {
    client: redis::Client,
    pool: Vec<MultiplexedConnection>,
    op_timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.pool.len())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

fn map_redis_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

impl RedisStore {
    pub async fn connect(url: &str, pool_size: usize, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_redis_err)?;
        let size = pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(map_redis_err)?;
            pool.push(conn);
        }
        Ok(Self {
            client,
            pool,
            op_timeout,
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        let index = rand::thread_rng().gen_range(0..self.pool.len());
        self.pool[index].clone()
    }

    // Every command gets a bounded deadline; an expired deadline is a store
    // failure like any other.
    async fn with_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_redis_err(err)),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.incr(key, 1).await })
            .await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.decr(key, 1).await })
            .await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.incr(key, delta).await })
            .await
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection();
        let raw: Option<String> = self
            .with_timeout(async move { conn.get(key).await })
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => match raw.parse::<i64>() {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    tracing::warn!(key, raw, "non-numeric value where integer expected");
                    Ok(None)
                }
            },
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.set(key, value).await })
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let added: i64 = self
            .with_timeout(async move { conn.sadd(key, member).await })
            .await?;
        Ok(added == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.smembers(key).await })
            .await
    }

    async fn sorted_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = self
            .with_timeout(async move { conn.zadd(key, member, score).await })
            .await?;
        Ok(())
    }

    async fn sorted_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.connection();
        self.with_timeout(async move { conn.zrangebyscore(key, min, max).await })
            .await
    }

    async fn sorted_remove_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.connection();
        let removed: i64 = self
            .with_timeout(async move { conn.zrembyscore(key, min, max).await })
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = self
            .with_timeout(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn atomic(&self, ops: &[WriteOp]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                WriteOp::IncrBy { key, delta } => {
                    pipe.incr(key, *delta).ignore();
                }
                WriteOp::SortedAdd { key, score, member } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                WriteOp::SortedRemoveByScore { key, min, max } => {
                    pipe.zrembyscore(key, *min, *max).ignore();
                }
            }
        }
        let mut conn = self.connection();
        self.with_timeout(async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = self
            .with_timeout(async move { conn.publish(channel, payload.as_ref()).await })
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>> {
        // Pub/sub needs its own connection; the multiplexed pool cannot enter
        // subscriber mode.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_err)?;
        pubsub.subscribe(channel).await.map_err(map_redis_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                {
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                }
                // The subscriber connection dropped; rebuild it until the
                // receiver side goes away.
                loop {
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    if tx.is_closed() {
                        return;
                    }
                    match client.get_async_pubsub().await {
                        Ok(mut fresh) => match fresh.subscribe(&channel).await {
                            Ok(()) => {
                                tracing::info!(channel, "bus subscriber reconnected");
                                pubsub = fresh;
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(channel, error = %err, "bus resubscribe failed");
                            }
                        },
                        Err(err) => {
                            tracing::warn!(channel, error = %err, "bus reconnect failed");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
