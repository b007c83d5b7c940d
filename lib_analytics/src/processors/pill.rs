use std::sync::Arc;

use crate::aggregator::WindowedAggregator;
use crate::decode::{decode_pill_batch, RawRecord};
use crate::errors::{ConfigurationError, ProcessorStateError};
use crate::models::DeviceClass;
use crate::settings::ProcessorSettings;
use crate::sinks::{keys, AggregateSink};

use super::{
    begin, commit, finish, flush_batches, BatchOutcome, Checkpointer, Clock, ProcessorCounters,
    ProcessorState, ShardLease, ShutdownReason,
};

/// Processes the batched pill heartbeat stream. Pills only report presence,
/// so the only store writes are the active sets.
pub struct PillShardProcessor {
    settings: ProcessorSettings,
    sink: Arc<dyn AggregateSink>,
    clock: Arc<dyn Clock>,
    state: ProcessorState,
    lease: Option<ShardLease>,
    aggregator: WindowedAggregator,
    counters: ProcessorCounters,
}

impl PillShardProcessor {
    pub fn new(
        settings: ProcessorSettings,
        sink: Arc<dyn AggregateSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        Ok(Self {
            settings,
            sink,
            clock,
            state: ProcessorState::Uninitialized,
            lease: None,
            aggregator: WindowedAggregator::new(),
            counters: ProcessorCounters::default(),
        })
    }

    pub fn initialize(&mut self, shard_id: &str) -> Result<(), ProcessorStateError> {
        let lease = ShardLease::open(
            &self.settings.app_name,
            shard_id,
            self.settings.checkpoint_track_period,
            self.clock.now_millis(),
        )?;
        begin(&mut self.state)?;
        self.lease = Some(lease);
        log::info!(
            "action=initialize shard={} stream=pill sink={}",
            shard_id,
            self.sink.backend_type()
        );
        Ok(())
    }

    pub async fn process_batch(
        &mut self,
        records: &[RawRecord],
        checkpointer: &mut dyn Checkpointer,
    ) -> BatchOutcome {
        let lease = match (&self.state, self.lease.as_mut()) {
            (ProcessorState::Active, Some(lease)) => lease,
            _ => {
                log::warn!(
                    "action=batch-ignored stream=pill state={:?} records={}",
                    self.state,
                    records.len()
                );
                return BatchOutcome::ignored(records.len());
            }
        };

        let now = self.clock.now_millis();
        let mut outcome = BatchOutcome {
            records: records.len(),
            ..Default::default()
        };

        for raw in records {
            let heartbeats = match decode_pill_batch(raw) {
                Ok(heartbeats) => heartbeats,
                Err(e) => {
                    outcome.decode_failures += 1;
                    self.counters.decode_failures += 1;
                    log::warn!("action=decode-failed shard={} error={}", lease.shard_id, e);
                    continue;
                }
            };
            outcome.decoded += 1;
            self.counters.messages_processed += 1;

            for heartbeat in &heartbeats {
                let ts = heartbeat.timestamp_millis();
                self.aggregator.observe_presence(&heartbeat.device_id, ts);

                if lease
                    .offer_checkpoint(self.sink.as_ref(), &mut self.counters, ts, now, &raw.sequence_number)
                    .await
                {
                    outcome.checkpoint_advances += 1;
                }
            }
        }

        let aggregates = self.aggregator.flush();
        outcome.devices_flushed = aggregates.len();
        outcome.flush_ok = flush_batches(
            self.sink.as_ref(),
            &mut self.counters,
            &lease.shard_id,
            aggregates.len(),
            vec![keys::presence_batch(DeviceClass::Pill, &aggregates, now)],
        )
        .await;

        outcome.commit_ok = commit(checkpointer, &mut self.counters, &lease.shard_id).await;

        log::debug!(
            "action=batch-processed stream=pill shard={} records={} decoded={} pills={} flush_ok={} commit_ok={}",
            lease.shard_id,
            outcome.records,
            outcome.decoded,
            outcome.devices_flushed,
            outcome.flush_ok,
            outcome.commit_ok
        );
        outcome
    }

    pub async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        checkpointer: &mut dyn Checkpointer,
    ) -> Result<(), ProcessorStateError> {
        let shard_id = self
            .lease
            .as_ref()
            .map(|l| l.shard_id.clone())
            .unwrap_or_default();
        finish(&mut self.state, &shard_id, reason, checkpointer, &mut self.counters).await
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn counters(&self) -> &ProcessorCounters {
        &self.counters
    }
}
