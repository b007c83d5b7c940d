use std::sync::Arc;

use crate::aggregator::WindowedAggregator;
use crate::anomaly::{AnomalyCounters, ThresholdAnomalyDetector};
use crate::decode::{decode_sense_record, RawRecord};
use crate::errors::{ConfigurationError, ProcessorStateError};
use crate::models::{DeviceClass, TelemetryRecord, DEFAULT_RSSI};
use crate::settings::ProcessorSettings;
use crate::sinks::{keys, AggregateSink};

use super::{
    begin, commit, finish, flush_batches, BatchOutcome, Checkpointer, Clock, ProcessorCounters,
    ProcessorState, ShardLease, ShutdownReason,
};

/// Processes the sense telemetry stream for one shard lease.
pub struct ShardProcessor {
    settings: ProcessorSettings,
    sink: Arc<dyn AggregateSink>,
    clock: Arc<dyn Clock>,
    detector: ThresholdAnomalyDetector,
    state: ProcessorState,
    lease: Option<ShardLease>,
    aggregator: WindowedAggregator,
    counters: ProcessorCounters,
    anomalies: AnomalyCounters,
}

impl ShardProcessor {
    pub fn new(
        settings: ProcessorSettings,
        sink: Arc<dyn AggregateSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        let detector = ThresholdAnomalyDetector::new(settings.thresholds.clone())?;
        Ok(Self {
            settings,
            sink,
            clock,
            detector,
            state: ProcessorState::Uninitialized,
            lease: None,
            aggregator: WindowedAggregator::new(),
            counters: ProcessorCounters::default(),
            anomalies: AnomalyCounters::default(),
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
            "action=initialize shard={} sink={}",
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
                    "action=batch-ignored state={:?} records={}",
                    self.state,
                    records.len()
                );
                return BatchOutcome::ignored(records.len());
            }
        };

        let now = self.clock.now_millis();
        lease.rotate_filter(now);

        let mut outcome = BatchOutcome {
            records: records.len(),
            ..Default::default()
        };

        for raw in records {
            let record = match decode_sense_record(raw) {
                Ok(record) => record,
                Err(e) => {
                    outcome.decode_failures += 1;
                    self.counters.decode_failures += 1;
                    log::warn!("action=decode-failed shard={} error={}", lease.shard_id, e);
                    continue;
                }
            };
            outcome.decoded += 1;
            self.counters.messages_processed += 1;

            self.aggregator.observe_record(&record);
            self.counters.record_uptime(record.uptime_seconds);
            count_low_uptime_reboot(
                lease,
                &mut self.counters,
                &record,
                self.settings.low_uptime_threshold_secs,
            );
            trace_wifi(&record);

            for sample in &record.samples {
                self.counters.wave_count_sum =
                    self.counters.wave_count_sum.saturating_add(sample.wave_count);

                if lease
                    .offer_checkpoint(
                        self.sink.as_ref(),
                        &mut self.counters,
                        sample.timestamp_millis(),
                        now,
                        &raw.sequence_number,
                    )
                    .await
                {
                    outcome.checkpoint_advances += 1;
                }

                self.detector.check_sample(
                    &record.device_id,
                    record.effective_firmware(sample),
                    sample,
                    &mut self.anomalies,
                );
            }
        }

        let aggregates = self.aggregator.flush();
        outcome.devices_flushed = aggregates.len();
        outcome.flush_ok = flush_batches(
            self.sink.as_ref(),
            &mut self.counters,
            &lease.shard_id,
            aggregates.len(),
            vec![
                keys::presence_batch(DeviceClass::Sense, &aggregates, now),
                keys::firmware_batch(&aggregates),
                keys::wifi_batch(&aggregates),
                keys::uptime_batch(&aggregates),
            ],
        )
        .await;

        outcome.commit_ok = commit(checkpointer, &mut self.counters, &lease.shard_id).await;

        log::debug!(
            "action=batch-processed shard={} records={} decoded={} decode_failures={} devices={} advances={} flush_ok={} commit_ok={}",
            lease.shard_id,
            outcome.records,
            outcome.decoded,
            outcome.decode_failures,
            outcome.devices_flushed,
            outcome.checkpoint_advances,
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
        finish(&mut self.state, &shard_id, reason, checkpointer, &mut self.counters).await?;

        let anomalies: Vec<String> = self
            .anomalies
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(kind, count)| format!("{}={}", kind.metric_name(), count))
            .collect();
        if !anomalies.is_empty() {
            log::info!("action=anomaly-summary shard={} {}", shard_id, anomalies.join(" "));
        }
        Ok(())
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn shard_id(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.shard_id.as_str())
    }

    pub fn counters(&self) -> &ProcessorCounters {
        &self.counters
    }

    pub fn anomalies(&self) -> &AnomalyCounters {
        &self.anomalies
    }

    pub fn last_checkpointed_at(&self) -> Option<i64> {
        self.lease.as_ref().map(|l| l.gate.last_checkpointed_at())
    }
}

/// A device that recently booted is counted once per filter rotation.
fn count_low_uptime_reboot(
    lease: &mut ShardLease,
    counters: &mut ProcessorCounters,
    record: &TelemetryRecord,
    threshold_secs: i64,
) {
    if record.uptime_seconds > threshold_secs || lease.filter.might_contain(&record.device_id) {
        return;
    }
    lease.filter.insert(&record.device_id);
    counters.low_uptime_reboots += 1;
    log::info!(
        "action=low-uptime-reboot shard={} device_id={} uptime={}",
        lease.shard_id,
        record.device_id,
        record.uptime_seconds
    );
}

fn trace_wifi(record: &TelemetryRecord) {
    let wifi = record.connected_wifi();
    if !wifi.ssid.is_empty() && wifi.rssi != DEFAULT_RSSI {
        log::trace!(
            "action=wifi-attributed device_id={} ssid={} rssi={}",
            record.device_id,
            wifi.ssid,
            wifi.rssi
        );
    }
}
