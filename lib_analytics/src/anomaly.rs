//! # Threshold Anomaly Detector
//!
//! Static range checks over the raw sensor readings of one sample. Bounds are
//! configuration because each hardware revision reports in its own ranges;
//! the defaults match the current sense hardware.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;
use crate::models::Sample;

/// One counter per (sensor, direction) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    LowCo2,
    HighCo2,
    LowPressure,
    HighPressure,
    HighUv,
    HighDust,
    HighLux,
    LowHumidity,
    HighHumidity,
    LowTemperature,
    HighTemperature,
    HighNoise,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 12] = [
        AnomalyKind::LowCo2,
        AnomalyKind::HighCo2,
        AnomalyKind::LowPressure,
        AnomalyKind::HighPressure,
        AnomalyKind::HighUv,
        AnomalyKind::HighDust,
        AnomalyKind::HighLux,
        AnomalyKind::LowHumidity,
        AnomalyKind::HighHumidity,
        AnomalyKind::LowTemperature,
        AnomalyKind::HighTemperature,
        AnomalyKind::HighNoise,
    ];

    pub fn metric_name(&self) -> &'static str {
        match self {
            AnomalyKind::LowCo2 => "low-co2",
            AnomalyKind::HighCo2 => "high-co2",
            AnomalyKind::LowPressure => "low-pa",
            AnomalyKind::HighPressure => "high-pa",
            AnomalyKind::HighUv => "high-uv",
            AnomalyKind::HighDust => "high-dust",
            AnomalyKind::HighLux => "high-lux",
            AnomalyKind::LowHumidity => "low-hum",
            AnomalyKind::HighHumidity => "high-hum",
            AnomalyKind::LowTemperature => "low-tmp",
            AnomalyKind::HighTemperature => "high-tmp",
            AnomalyKind::HighNoise => "high-db",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Monotonic anomaly counters for the lifetime of a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalyCounters {
    counts: [u64; 12],
}

impl AnomalyCounters {
    pub fn increment(&mut self, kind: AnomalyKind) {
        self.counts[kind.index()] += 1;
    }

    pub fn get(&self, kind: AnomalyKind) -> u64 {
        self.counts[kind.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnomalyKind, u64)> + '_ {
        AnomalyKind::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }
}

/// Valid ranges, in the device's raw fixed-point units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SensorThresholds {
    /// ppm
    pub low_co2: i64,
    pub high_co2: i64,
    /// mbar * 256 * 100
    pub low_pressure: i64,
    pub high_pressure: i64,
    pub high_uv: i64,
    /// Raw counts; roughly 6 per ug/m3.
    pub high_dust: i64,
    pub high_lux: i64,
    /// % * 100
    pub low_humidity: i64,
    pub high_humidity: i64,
    /// deg C * 100
    pub low_temperature: i64,
    pub high_temperature: i64,
    /// dB * 100, offset by 40 dB
    pub high_noise: i64,
}

impl Default for SensorThresholds {
    fn default() -> Self {
        Self {
            low_co2: 400,
            high_co2: 3500,
            low_pressure: 900 * 256 * 100,
            high_pressure: 1000 * 256 * 100,
            high_uv: 6,
            high_dust: 250 * 6,
            high_lux: 2000,
            low_humidity: 100,
            high_humidity: 99 * 100,
            low_temperature: 0,
            high_temperature: 100 * 100,
            high_noise: (150 + 40) * 100,
        }
    }
}

impl SensorThresholds {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ranges = [
            ("co2", self.low_co2, self.high_co2),
            ("pressure", self.low_pressure, self.high_pressure),
            ("humidity", self.low_humidity, self.high_humidity),
            ("temperature", self.low_temperature, self.high_temperature),
        ];
        for (sensor, low, high) in ranges {
            if low >= high {
                return Err(ConfigurationError::InvertedBounds { sensor, low, high });
            }
        }

        let ceilings = [
            ("high_uv", self.high_uv),
            ("high_dust", self.high_dust),
            ("high_lux", self.high_lux),
            ("high_noise", self.high_noise),
        ];
        for (name, value) in ceilings {
            if value < 0 {
                return Err(ConfigurationError::InvalidValue {
                    name,
                    reason: format!("{value} is negative"),
                });
            }
        }
        Ok(())
    }
}

/// Holds only its bounds; all state lives in the caller's `AnomalyCounters`.
#[derive(Debug, Clone)]
pub struct ThresholdAnomalyDetector {
    thresholds: SensorThresholds,
}

impl ThresholdAnomalyDetector {
    pub fn new(thresholds: SensorThresholds) -> Result<Self, ConfigurationError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// Runs every check against one sample and returns how many fired.
    pub fn check_sample(
        &self,
        device_id: &str,
        fw_version: Option<i64>,
        sample: &Sample,
        counters: &mut AnomalyCounters,
    ) -> usize {
        let t = &self.thresholds;
        let r = &sample.readings;
        let mut fired = 0;

        let mut flag = |kind: AnomalyKind, sensor: &str, value: i64| {
            counters.increment(kind);
            fired += 1;
            log::error!(
                "bad_sensor={} sensor_val={} device_id={} fw_version={}",
                sensor,
                value,
                device_id,
                fw_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
            );
        };

        if let Some(co2) = r.co2 {
            if co2 < t.low_co2 {
                flag(AnomalyKind::LowCo2, "co2", co2);
            } else if co2 > t.high_co2 {
                flag(AnomalyKind::HighCo2, "co2", co2);
            }
        }

        if let Some(pa) = r.pressure {
            if pa < t.low_pressure {
                flag(AnomalyKind::LowPressure, "pa", pa);
            } else if pa > t.high_pressure {
                flag(AnomalyKind::HighPressure, "pa", pa);
            }
        }

        if let Some(uv) = r.uv_count {
            if uv > t.high_uv {
                flag(AnomalyKind::HighUv, "uv", uv);
            }
        }

        if let Some(dust) = r.dust {
            if dust > t.high_dust {
                flag(AnomalyKind::HighDust, "dust", dust);
            }
        }

        if let Some(lux) = r.lux {
            if lux > t.high_lux {
                flag(AnomalyKind::HighLux, "uvlux", lux);
            }
        }

        if let Some(clear) = r.clear_lux {
            if clear > t.high_lux {
                flag(AnomalyKind::HighLux, "clearlux", clear);
            }
        }

        if let Some(hum) = r.humidity {
            if hum < t.low_humidity {
                flag(AnomalyKind::LowHumidity, "hum", hum);
            } else if hum > t.high_humidity {
                flag(AnomalyKind::HighHumidity, "hum", hum);
            }
        }

        if let Some(tmp) = r.temperature {
            if tmp < t.low_temperature {
                flag(AnomalyKind::LowTemperature, "tmp", tmp);
            } else if tmp > t.high_temperature {
                flag(AnomalyKind::HighTemperature, "tmp", tmp);
            }
        }

        if let Some(db) = r.noise_db {
            if db > t.high_noise {
                flag(AnomalyKind::HighNoise, "db", db);
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SensorReadings;

    fn detector() -> ThresholdAnomalyDetector {
        ThresholdAnomalyDetector::new(SensorThresholds::default()).unwrap()
    }

    fn sample(readings: SensorReadings) -> Sample {
        Sample {
            unix_time: 1,
            readings,
            ..Default::default()
        }
    }

    #[test]
    fn low_co2_counts_once_and_only_low() {
        let mut counters = AnomalyCounters::default();
        let s = sample(SensorReadings { co2: Some(200), ..Default::default() });

        assert_eq!(detector().check_sample("sense-1", Some(5), &s, &mut counters), 1);
        assert_eq!(counters.get(AnomalyKind::LowCo2), 1);
        assert_eq!(counters.get(AnomalyKind::HighCo2), 0);
    }

    #[test]
    fn absent_readings_are_never_zero() {
        let mut counters = AnomalyCounters::default();
        let s = sample(SensorReadings::default());

        assert_eq!(detector().check_sample("sense-1", None, &s, &mut counters), 0);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn in_range_sample_is_quiet() {
        let mut counters = AnomalyCounters::default();
        let s = sample(SensorReadings {
            co2: Some(800),
            pressure: Some(950 * 256 * 100),
            uv_count: Some(1),
            dust: Some(300),
            lux: Some(150),
            clear_lux: Some(150),
            humidity: Some(4500),
            temperature: Some(2150),
            noise_db: Some(4000),
        });
        assert_eq!(detector().check_sample("sense-1", Some(5), &s, &mut counters), 0);
    }

    #[test]
    fn both_lux_channels_feed_the_same_counter() {
        let mut counters = AnomalyCounters::default();
        let s = sample(SensorReadings {
            lux: Some(5000),
            clear_lux: Some(5000),
            ..Default::default()
        });
        detector().check_sample("sense-1", None, &s, &mut counters);
        assert_eq!(counters.get(AnomalyKind::HighLux), 2);
    }

    #[test]
    fn every_direction_has_its_own_counter() {
        let mut counters = AnomalyCounters::default();
        let high = sample(SensorReadings {
            co2: Some(9000),
            pressure: Some(1100 * 256 * 100),
            uv_count: Some(7),
            dust: Some(2000),
            humidity: Some(9950),
            temperature: Some(10001),
            noise_db: Some(19001),
            ..Default::default()
        });
        let low = sample(SensorReadings {
            pressure: Some(0),
            humidity: Some(50),
            temperature: Some(-5),
            ..Default::default()
        });
        let d = detector();
        d.check_sample("sense-1", None, &high, &mut counters);
        d.check_sample("sense-1", None, &low, &mut counters);

        for kind in AnomalyKind::ALL {
            let expected = match kind {
                AnomalyKind::LowCo2 | AnomalyKind::HighLux => 0,
                _ => 1,
            };
            assert_eq!(counters.get(kind), expected, "{}", kind.metric_name());
        }
    }

    #[test]
    fn inverted_range_is_rejected() {
        let thresholds = SensorThresholds {
            low_humidity: 9000,
            high_humidity: 100,
            ..Default::default()
        };
        assert!(matches!(
            ThresholdAnomalyDetector::new(thresholds),
            Err(ConfigurationError::InvertedBounds { sensor: "humidity", .. })
        ));
    }
}
