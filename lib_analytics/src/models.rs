//! # Telemetry Models
//!
//! The decoded shape of a sense upload and the per-batch device aggregates
//! built from it. Wire decoding lives in `decode`; everything here is plain
//! data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SSID recorded when a device reports no connected network.
pub const DEFAULT_SSID: &str = "";
/// RSSI recorded when the connected network is not in the scan list.
pub const DEFAULT_RSSI: i64 = 0;
/// Firmware string the devices send when a slot is not populated.
pub const DEFAULT_FIRMWARE: &str = "0";

/// One decoded sense upload: a device, when it was received, and the
/// periodic samples it carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    /// Receipt timestamp, epoch milliseconds.
    pub received_at: i64,
    #[serde(default)]
    pub uptime_seconds: i64,
    /// Informational only.
    #[serde(default)]
    pub ip_address: String,
    /// Record-level firmware; wins over the per-sample version when present.
    #[serde(default)]
    pub firmware_version: Option<i64>,
    #[serde(default)]
    pub top_firmware_version: Option<String>,
    #[serde(default)]
    pub middle_firmware_version: Option<String>,
    #[serde(default)]
    pub connected_ssid: Option<String>,
    #[serde(default)]
    pub scan_list: Vec<WifiAccessPoint>,
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl TelemetryRecord {
    /// Firmware version that applies to `sample`: record-level first, then the sample's own.
    pub fn effective_firmware(&self, sample: &Sample) -> Option<i64> {
        self.firmware_version.or(sample.firmware_version)
    }

    /// Best-effort wifi attribution. The RSSI comes from the scan entry whose
    /// SSID literally equals the connected SSID; anything else falls back to
    /// the defaults.
    pub fn connected_wifi(&self) -> WifiInfo {
        let ssid = self
            .connected_ssid
            .clone()
            .unwrap_or_else(|| DEFAULT_SSID.to_string());

        let rssi = self
            .scan_list
            .iter()
            .find(|ap| ap.ssid == ssid)
            .map(|ap| ap.rssi)
            .unwrap_or(DEFAULT_RSSI);

        WifiInfo { ssid, rssi }
    }

    /// Record-level top/middle firmware strings, if either is populated.
    pub fn firmware_override(&self) -> Option<FirmwareOverride> {
        let top = populated(self.top_firmware_version.as_deref());
        let middle = populated(self.middle_firmware_version.as_deref());
        if top.is_none() && middle.is_none() {
            return None;
        }
        Some(FirmwareOverride {
            top: top.map(str::to_string),
            middle: middle.map(str::to_string),
        })
    }

    /// Timestamp used for record-level firmware: the newest sample, or receipt time.
    pub fn latest_sample_millis(&self) -> i64 {
        self.samples
            .iter()
            .map(Sample::timestamp_millis)
            .max()
            .unwrap_or(self.received_at)
    }
}

fn populated(version: Option<&str>) -> Option<&str> {
    version.filter(|v| !v.is_empty() && *v != DEFAULT_FIRMWARE)
}

/// A single periodic sample inside a sense upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Epoch seconds.
    pub unix_time: i64,
    #[serde(default)]
    pub firmware_version: Option<i64>,
    #[serde(default)]
    pub wave_count: i64,
    #[serde(flatten)]
    pub readings: SensorReadings,
}

impl Sample {
    pub fn timestamp_millis(&self) -> i64 {
        self.unix_time.saturating_mul(1000)
    }
}

/// Raw sensor values as the device reports them (fixed-point where the
/// hardware is). Absent readings stay `None` and are never treated as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReadings {
    #[serde(default)]
    pub co2: Option<i64>,
    #[serde(default)]
    pub pressure: Option<i64>,
    #[serde(default)]
    pub uv_count: Option<i64>,
    #[serde(default)]
    pub dust: Option<i64>,
    #[serde(default)]
    pub lux: Option<i64>,
    #[serde(default)]
    pub clear_lux: Option<i64>,
    #[serde(default)]
    pub humidity: Option<i64>,
    #[serde(default)]
    pub temperature: Option<i64>,
    #[serde(default)]
    pub noise_db: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiAccessPoint {
    pub ssid: String,
    pub rssi: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiInfo {
    pub ssid: String,
    pub rssi: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareOverride {
    pub top: Option<String>,
    pub middle: Option<String>,
}

/// One pill heartbeat from a batched pill upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PillHeartbeat {
    pub device_id: String,
    /// Epoch seconds.
    pub timestamp: i64,
}

impl PillHeartbeat {
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.saturating_mul(1000)
    }
}

/// Device families tracked in separate key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Sense,
    Pill,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Sense => "sense",
            DeviceClass::Pill => "pill",
        }
    }
}

/// Where the firmware entries of an aggregate came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FirmwareSource {
    #[default]
    Samples,
    /// Pinned by record-level top/middle strings; per-sample versions are ignored.
    RecordLevel,
}

/// Everything one batch taught us about one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceAggregate {
    /// Receipt timestamp of the last record seen for the device, epoch ms.
    pub last_seen_at: Option<i64>,
    /// Middle (main) firmware version → newest sample timestamp carrying it.
    pub firmware_seen: BTreeMap<String, i64>,
    /// Top-board firmware version → timestamp. Only set by record-level overrides.
    pub top_firmware_seen: BTreeMap<String, i64>,
    pub firmware_source: FirmwareSource,
    pub wifi: Option<WifiInfo>,
    pub uptime_seconds: Option<i64>,
}

/// Aggregates for one batch keyed by device id.
pub type DeviceAggregates = BTreeMap<String, DeviceAggregate>;
