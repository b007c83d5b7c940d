//! Drives one processor per shard: delivers ordered batches from the replay
//! file, stops on shutdown, end of file or a lost lease.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lib_analytics::errors::ProcessorStateError;
use lib_analytics::{
    BatchOutcome, Checkpointer, PillShardProcessor, RawRecord, ShardProcessor, ShutdownReason,
};
use tokio::sync::broadcast;

use super::lease::{LeaseTable, ShardCheckpointer};
use super::replay::ShardReplay;

/// The lifecycle the coordinator expects from a shard processor.
#[async_trait]
pub trait ShardWorker: Send + 'static {
    fn initialize(&mut self, shard_id: &str) -> Result<(), ProcessorStateError>;

    async fn process_batch(
        &mut self,
        records: &[RawRecord],
        checkpointer: &mut dyn Checkpointer,
    ) -> BatchOutcome;

    async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<(), ProcessorStateError>;
}

#[async_trait]
impl ShardWorker for ShardProcessor {
    fn initialize(&mut self, shard_id: &str) -> Result<(), ProcessorStateError> {
        ShardProcessor::initialize(self, shard_id)
    }

    async fn process_batch(
        &mut self,
        records: &[RawRecord],
        checkpointer: &mut dyn Checkpointer,
    ) -> BatchOutcome {
        ShardProcessor::process_batch(self, records, checkpointer).await
    }

    async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<(), ProcessorStateError> {
        ShardProcessor::shutdown(self, reason, checkpointer).await
    }
}

#[async_trait]
impl ShardWorker for PillShardProcessor {
    fn initialize(&mut self, shard_id: &str) -> Result<(), ProcessorStateError> {
        PillShardProcessor::initialize(self, shard_id)
    }

    async fn process_batch(
        &mut self,
        records: &[RawRecord],
        checkpointer: &mut dyn Checkpointer,
    ) -> BatchOutcome {
        PillShardProcessor::process_batch(self, records, checkpointer).await
    }

    async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<(), ProcessorStateError> {
        PillShardProcessor::shutdown(self, reason, checkpointer).await
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub replay_dir: PathBuf,
    pub max_records: usize,
    pub idle_time_between_reads: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub shard_id: String,
    pub batches: usize,
    pub records: usize,
    pub decode_failures: usize,
    pub reason: ShutdownReason,
}

/// Runs one shard to completion. The lease must already be acquired; the
/// replay resumes after the lease's committed position.
pub async fn run_shard<P: ShardWorker>(
    mut processor: P,
    table: LeaseTable,
    shard_id: String,
    options: ReplayOptions,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<ShardSummary> {
    let resume_after = table.checkpoint_of(&shard_id).await;
    let mut replay = ShardReplay::open(&options.replay_dir, &shard_id, resume_after)
        .await
        .with_context(|| format!("opening replay for shard {shard_id}"))?;
    let mut checkpointer = ShardCheckpointer::new(table.clone(), shard_id.clone(), resume_after);

    processor
        .initialize(&shard_id)
        .with_context(|| format!("initializing processor for shard {shard_id}"))?;

    let mut summary = ShardSummary {
        shard_id: shard_id.clone(),
        batches: 0,
        records: 0,
        decode_failures: 0,
        reason: ShutdownReason::Terminate,
    };

    summary.reason = loop {
        if !table.is_owner(&shard_id).await {
            break ShutdownReason::Zombie;
        }

        let batch = tokio::select! {
            _ = shutdown.recv() => break ShutdownReason::Terminate,
            read = replay.next_batch(options.max_records) => read,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                log::error!("action=replay-read-failed shard={} error={}", shard_id, e);
                break ShutdownReason::Terminate;
            }
        };
        if batch.is_empty() {
            log::info!("action=replay-exhausted shard={} position={}", shard_id, replay.position());
            break ShutdownReason::Terminate;
        }

        checkpointer.mark_delivered(replay.position());
        // The batch is drained even if shutdown arrives meanwhile
        let outcome = processor.process_batch(&batch, &mut checkpointer).await;
        summary.batches += 1;
        summary.records += outcome.records;
        summary.decode_failures += outcome.decode_failures;

        if !options.idle_time_between_reads.is_zero() {
            tokio::select! {
                _ = shutdown.recv() => break ShutdownReason::Terminate,
                _ = tokio::time::sleep(options.idle_time_between_reads) => {}
            }
        }
    };

    processor
        .shutdown(summary.reason, &mut checkpointer)
        .await
        .with_context(|| format!("shutting down processor for shard {shard_id}"))?;

    log::info!(
        "action=shard-finished shard={} reason={:?} batches={} records={} decode_failures={}",
        shard_id,
        summary.reason,
        summary.batches,
        summary.records,
        summary.decode_failures
    );
    Ok(summary)
}
