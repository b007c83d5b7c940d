//! Tunables shared by both processors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anomaly::SensorThresholds;
use crate::errors::ConfigurationError;

/// Reboots are only counted for devices that have been up for at most this long.
pub const LOW_UPTIME_THRESHOLD_SECS: i64 = 60 * 60;

pub const DEFAULT_CHECKPOINT_TRACK_PERIOD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessorSettings {
    /// Prefix of the checkpoint trail partition key.
    pub app_name: String,
    #[serde(with = "duration_minutes")]
    pub checkpoint_track_period: Duration,
    pub low_uptime_threshold_secs: i64,
    pub thresholds: SensorThresholds,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            app_name: "sense_stats".to_string(),
            checkpoint_track_period: DEFAULT_CHECKPOINT_TRACK_PERIOD,
            low_uptime_threshold_secs: LOW_UPTIME_THRESHOLD_SECS,
            thresholds: SensorThresholds::default(),
        }
    }
}

impl ProcessorSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigurationError::Missing("app_name"));
        }
        if self.checkpoint_track_period.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                name: "checkpoint_track_period",
                reason: "must be positive".to_string(),
            });
        }
        if self.low_uptime_threshold_secs < 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "low_uptime_threshold_secs",
                reason: format!("{} is negative", self.low_uptime_threshold_secs),
            });
        }
        self.thresholds.validate()
    }
}

/// Track periods are configured in whole minutes.
mod duration_minutes {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs() / 60)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let minutes = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(minutes.saturating_mul(60)))
    }
}
