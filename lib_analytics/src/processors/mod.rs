//! # Shard Processors
//!
//! One processor owns one shard lease. The coordinator drives it through
//! `initialize`, any number of `process_batch` calls, and a final `shutdown`.
//! Batches for a shard are strictly sequential, so the dedup filter, the
//! checkpoint gate and the aggregator need no locking.
//!
//! Nothing that goes wrong inside a batch escapes it: decode, store and
//! commit failures are logged and counted, and the batch is still reported
//! as processed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::checkpoint_gate::CheckpointGate;
use crate::errors::{CheckpointCommitError, ProcessorStateError};
use crate::membership::RotatingMembershipFilter;
use crate::sinks::{AggregateSink, CheckpointTrail, WriteBatch};

mod pill;
mod sense;

pub use pill::PillShardProcessor;
pub use sense::ShardProcessor;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    Active,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The stream ended or the worker is stopping; the lease is handed back.
    Terminate,
    /// The coordinator asked for the lease back.
    Requested,
    /// The lease was taken by another worker. Committing now would clobber it.
    Zombie,
}

impl ShutdownReason {
    pub fn is_clean_handoff(&self) -> bool {
        matches!(self, ShutdownReason::Terminate | ShutdownReason::Requested)
    }
}

/// The coordinator's handle for committing a shard's position.
#[async_trait]
pub trait Checkpointer: Send {
    /// Commits the position of the last record delivered to the processor.
    async fn checkpoint(&mut self) -> Result<(), CheckpointCommitError>;
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub records: usize,
    pub decoded: usize,
    pub decode_failures: usize,
    pub devices_flushed: usize,
    pub checkpoint_advances: usize,
    pub flush_ok: bool,
    pub commit_ok: bool,
    /// The processor was not active and did not look at the batch.
    pub ignored: bool,
}

impl BatchOutcome {
    fn ignored(records: usize) -> Self {
        Self {
            records,
            ignored: true,
            ..Default::default()
        }
    }
}

/// Lifetime counters of one processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorCounters {
    pub messages_processed: u64,
    pub decode_failures: u64,
    pub wave_count_sum: i64,
    pub low_uptime_reboots: u64,
    pub checkpoint_advances: u64,
    pub sink_failures: u64,
    pub commit_failures: u64,
    /// Whole days of uptime → records reporting it.
    pub uptime_days: BTreeMap<i64, u64>,
}

impl ProcessorCounters {
    pub(crate) fn record_uptime(&mut self, uptime_seconds: i64) {
        let days = uptime_seconds.max(0) / SECONDS_PER_DAY;
        *self.uptime_days.entry(days).or_insert(0) += 1;
    }
}

/// Per-lease state, rebuilt on every `initialize`.
#[derive(Debug)]
pub(crate) struct ShardLease {
    pub shard_id: String,
    /// `<app_name>:<shard_id>`
    pub partition_key: String,
    pub filter: RotatingMembershipFilter,
    pub gate: CheckpointGate,
}

impl ShardLease {
    pub fn open(
        app_name: &str,
        shard_id: &str,
        track_period: Duration,
        now_millis: i64,
    ) -> Result<Self, ProcessorStateError> {
        Ok(Self {
            shard_id: shard_id.to_string(),
            partition_key: format!("{app_name}:{shard_id}"),
            filter: RotatingMembershipFilter::new(now_millis),
            gate: CheckpointGate::new(track_period)?,
        })
    }

    pub fn rotate_filter(&mut self, now_millis: i64) {
        self.filter.rotate_if_expired(now_millis);
    }

    /// Offers a timestamp to the gate and, if it is eligible, advances it and
    /// writes the trail entry. Returns whether the gate advanced.
    pub async fn offer_checkpoint(
        &mut self,
        trail: &dyn AggregateSink,
        counters: &mut ProcessorCounters,
        timestamp: i64,
        now_millis: i64,
        sequence_number: &str,
    ) -> bool {
        if !self.gate.is_eligible(timestamp, now_millis) {
            return false;
        }
        self.gate.advance(timestamp);
        counters.checkpoint_advances += 1;

        if let Err(e) = trail
            .record_advance(&self.partition_key, timestamp, sequence_number)
            .await
        {
            log::error!(
                "action=checkpoint-track-failed shard={} sequence_number={} error={}",
                self.shard_id,
                sequence_number,
                e
            );
        }
        true
    }
}

/// Transitions `Uninitialized → Active`.
pub(crate) fn begin(state: &mut ProcessorState) -> Result<(), ProcessorStateError> {
    if *state != ProcessorState::Uninitialized {
        return Err(ProcessorStateError::InvalidTransition {
            action: "initialize",
            state: *state,
        });
    }
    *state = ProcessorState::Active;
    Ok(())
}

/// Writes each non-empty category. Returns false if any write failed.
pub(crate) async fn flush_batches(
    sink: &dyn AggregateSink,
    counters: &mut ProcessorCounters,
    shard_id: &str,
    devices: usize,
    batches: Vec<WriteBatch>,
) -> bool {
    let mut ok = true;
    for batch in batches.iter().filter(|b| !b.is_empty()) {
        if let Err(e) = sink.apply(batch).await {
            ok = false;
            counters.sink_failures += 1;
            log::error!(
                "action=flush-failed shard={} backend={} category={} devices={} error={}",
                shard_id,
                sink.backend_type(),
                batch.category,
                devices,
                e
            );
        }
    }
    ok
}

pub(crate) async fn commit(
    checkpointer: &mut dyn Checkpointer,
    counters: &mut ProcessorCounters,
    shard_id: &str,
) -> bool {
    match checkpointer.checkpoint().await {
        Ok(()) => true,
        Err(e) => {
            counters.commit_failures += 1;
            log::error!("action=checkpoint-commit-failed shard={} error={}", shard_id, e);
            false
        }
    }
}

/// `Active → ShuttingDown → Terminated`, committing once on a clean handoff.
pub(crate) async fn finish(
    state: &mut ProcessorState,
    shard_id: &str,
    reason: ShutdownReason,
    checkpointer: &mut dyn Checkpointer,
    counters: &mut ProcessorCounters,
) -> Result<(), ProcessorStateError> {
    if *state != ProcessorState::Active {
        return Err(ProcessorStateError::InvalidTransition {
            action: "shutdown",
            state: *state,
        });
    }
    *state = ProcessorState::ShuttingDown;

    if reason.is_clean_handoff() {
        commit(checkpointer, counters, shard_id).await;
    } else {
        log::warn!(
            "action=shutdown-lease-lost shard={} reason={:?} checkpoint=skipped",
            shard_id,
            reason
        );
    }

    *state = ProcessorState::Terminated;
    log::info!(
        "action=shutdown shard={} reason={:?} messages={} decode_failures={} reboots={} advances={} sink_failures={} commit_failures={}",
        shard_id,
        reason,
        counters.messages_processed,
        counters.decode_failures,
        counters.low_uptime_reboots,
        counters.checkpoint_advances,
        counters.sink_failures,
        counters.commit_failures
    );
    Ok(())
}
