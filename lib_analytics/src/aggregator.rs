//! # Windowed Aggregator
//!
//! Folds the records of exactly one batch into last-write-wins per-device
//! aggregates. `flush` hands the result to the caller and starts over, so
//! nothing survives between batches and redelivery of a batch produces the
//! same writes.

use std::collections::BTreeSet;

use crate::models::{
    DeviceAggregate, DeviceAggregates, FirmwareOverride, FirmwareSource, TelemetryRecord,
    WifiInfo,
};

#[derive(Debug, Default)]
pub struct WindowedAggregator {
    aggregates: DeviceAggregates,
    /// Devices whose firmware was pinned by a record-level override this batch.
    pinned: BTreeSet<String>,
}

impl WindowedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, device_id: &str) -> &mut DeviceAggregate {
        self.aggregates.entry(device_id.to_string()).or_default()
    }

    /// Presence: the receipt timestamp of the latest record wins.
    pub fn observe(&mut self, record: &TelemetryRecord) {
        self.observe_presence(&record.device_id, record.received_at);
    }

    pub fn observe_presence(&mut self, device_id: &str, seen_at: i64) {
        self.entry(device_id).last_seen_at = Some(seen_at);
    }

    /// Keeps the newest timestamp per version. Ignored once the device has
    /// been pinned by a record-level override.
    pub fn observe_firmware(&mut self, device_id: &str, version: &str, timestamp: i64) {
        if self.pinned.contains(device_id) {
            return;
        }
        let seen = self
            .entry(device_id)
            .firmware_seen
            .entry(version.to_string())
            .or_insert(i64::MIN);
        if *seen < timestamp {
            *seen = timestamp;
        }
    }

    /// Record-level top/middle strings replace whatever the samples said.
    pub fn observe_firmware_override(
        &mut self,
        device_id: &str,
        firmware: &FirmwareOverride,
        timestamp: i64,
    ) {
        let aggregate = self.entry(device_id);
        aggregate.firmware_seen.clear();
        aggregate.top_firmware_seen.clear();
        aggregate.firmware_source = FirmwareSource::RecordLevel;
        if let Some(middle) = &firmware.middle {
            aggregate.firmware_seen.insert(middle.clone(), timestamp);
        }
        if let Some(top) = &firmware.top {
            aggregate.top_firmware_seen.insert(top.clone(), timestamp);
        }
        self.pinned.insert(device_id.to_string());
    }

    pub fn observe_wifi(&mut self, device_id: &str, ssid: &str, rssi: i64) {
        self.entry(device_id).wifi = Some(WifiInfo {
            ssid: ssid.to_string(),
            rssi,
        });
    }

    pub fn observe_uptime(&mut self, device_id: &str, uptime_seconds: i64) {
        self.entry(device_id).uptime_seconds = Some(uptime_seconds);
    }

    /// Applies every per-record observation: presence, firmware (with the
    /// record-level override taking precedence), wifi and uptime.
    pub fn observe_record(&mut self, record: &TelemetryRecord) {
        let device_id = record.device_id.as_str();
        self.observe(record);

        match record.firmware_override() {
            Some(firmware) => {
                self.observe_firmware_override(device_id, &firmware, record.latest_sample_millis());
            }
            None => {
                for sample in &record.samples {
                    if let Some(version) = record.effective_firmware(sample) {
                        self.observe_firmware(
                            device_id,
                            &version.to_string(),
                            sample.timestamp_millis(),
                        );
                    }
                }
            }
        }

        let wifi = record.connected_wifi();
        self.observe_wifi(device_id, &wifi.ssid, wifi.rssi);
        self.observe_uptime(device_id, record.uptime_seconds);
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Returns the batch's aggregates and resets to empty.
    pub fn flush(&mut self) -> DeviceAggregates {
        self.pinned.clear();
        std::mem::take(&mut self.aggregates)
    }
}
