//! In-memory sink for dry runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{AggregateSink, StoreOp, WriteBatch};
use crate::errors::SinkWriteError;

/// Records every applied batch. Flip `set_failing(true)` to make every
/// write fail as a unit.
#[derive(Debug, Default)]
pub struct MemorySink {
    applied: Mutex<Vec<WriteBatch>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WriteBatch>> {
        // A panic while holding the lock cannot leave a half-pushed batch behind.
        self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn batches(&self) -> Vec<WriteBatch> {
        self.lock().clone()
    }

    pub fn batches_for(&self, category: &str) -> Vec<WriteBatch> {
        self.lock()
            .iter()
            .filter(|b| b.category == category)
            .cloned()
            .collect()
    }

    /// All ops ever applied, in order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().iter().flat_map(|b| b.ops.clone()).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[async_trait]
impl AggregateSink for MemorySink {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), SinkWriteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkWriteError::Rejected(format!(
                "memory sink is failing ({} ops in {})",
                batch.len(),
                batch.category
            )));
        }
        log::trace!(
            "action=memory-sink-apply category={} ops={}",
            batch.category,
            batch.len()
        );
        self.lock().push(batch.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
