//! # Aggregate Sinks
//!
//! The core decides *what* to write (key layout lives in [`keys`]) and hands
//! each category to a backend as one [`WriteBatch`]. A backend must apply a
//! batch atomically or report failure for the whole batch; the processors
//! never retry.

use async_trait::async_trait;

use crate::errors::SinkWriteError;

pub mod keys;
pub mod memory;

#[cfg(feature = "connections")]
pub mod redis_sink;

pub use memory::MemorySink;

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    ZAdd { key: String, score: i64, member: String },
    HSet { key: String, field: String, value: String },
    SAdd { key: String, member: String },
    /// Absolute expiry, epoch seconds.
    ExpireAt { key: String, at: i64 },
}

/// Everything one category of a batch writes. Applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub category: &'static str,
    pub ops: Vec<StoreOp>,
}

impl WriteBatch {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Atomic multi-op writer for per-batch aggregates.
#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), SinkWriteError>;

    /// Short backend name for logs.
    fn backend_type(&self) -> &'static str;
}

/// Keyed upsert of checkpoint advances. Audit only; nothing reads it back
/// on the hot path.
#[async_trait]
pub trait CheckpointTrail: Send + Sync {
    async fn record_advance(
        &self,
        partition_key: &str,
        checkpointed_at: i64,
        sequence_number: &str,
    ) -> Result<(), SinkWriteError>;
}

/// Any aggregate sink can hold the trail: it is one `HSET` per advance.
#[async_trait]
impl<S> CheckpointTrail for S
where
    S: AggregateSink + ?Sized,
{
    async fn record_advance(
        &self,
        partition_key: &str,
        checkpointed_at: i64,
        sequence_number: &str,
    ) -> Result<(), SinkWriteError> {
        let batch = keys::checkpoint_track_batch(partition_key, checkpointed_at, sequence_number);
        self.apply(&batch).await
    }
}
