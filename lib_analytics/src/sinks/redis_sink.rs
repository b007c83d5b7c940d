//! # Redis Aggregate Sink
//!
//! Applies each `WriteBatch` as one `MULTI`/`EXEC` pipeline over a shared
//! connection manager. The manager is cheap to clone and safe to use from
//! every shard task at once.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Pipeline};

use super::{AggregateSink, StoreOp, WriteBatch};
use crate::errors::SinkWriteError;

/// Default bound on a single pipeline round trip.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct RedisAggregateSink {
    conn: ConnectionManager,
    response_timeout: Duration,
}

impl RedisAggregateSink {
    /// Opens the client and establishes the managed connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str, response_timeout: Duration) -> Result<Self, SinkWriteError> {
        let client = Client::open(url).map_err(|e| SinkWriteError::Connection(e.to_string()))?;
        let conn = tokio::time::timeout(response_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| SinkWriteError::Timeout(response_timeout.as_millis() as u64))?
            .map_err(|e| SinkWriteError::Connection(e.to_string()))?;

        log::info!("action=redis-sink-connected url={}", url);
        Ok(Self {
            conn,
            response_timeout,
        })
    }

    fn pipeline(batch: &WriteBatch) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &batch.ops {
            match op {
                StoreOp::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreOp::HSet { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                StoreOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreOp::ExpireAt { key, at } => {
                    pipe.expire_at(key, *at).ignore();
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl AggregateSink for RedisAggregateSink {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), SinkWriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        let pipe = Self::pipeline(batch);
        let mut conn = self.conn.clone();

        tokio::time::timeout(self.response_timeout, pipe.query_async::<()>(&mut conn))
            .await
            .map_err(|_| SinkWriteError::Timeout(self.response_timeout.as_millis() as u64))?
            .map_err(|e| SinkWriteError::Rejected(format!("{}: {}", batch.category, e)))
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}
