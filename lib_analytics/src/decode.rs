//! # Record Decoding
//!
//! Stream records arrive as opaque bytes plus the coordinator's position
//! token. Decoding is a pure function returning `Result` so the batch loop can
//! skip a malformed record without aborting the rest.

use serde::Deserialize;

use crate::errors::RecordDecodeError;
use crate::models::{PillHeartbeat, TelemetryRecord};

/// A record as delivered by the streaming coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Opaque stream position token.
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Vec<u8>,
}

impl RawRecord {
    pub fn new(sequence_number: impl Into<String>, partition_key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            partition_key: partition_key.into(),
            data,
        }
    }
}

pub fn decode_sense_record(raw: &RawRecord) -> Result<TelemetryRecord, RecordDecodeError> {
    if raw.data.is_empty() {
        return Err(RecordDecodeError::EmptyPayload {
            sequence_number: raw.sequence_number.clone(),
        });
    }

    let record: TelemetryRecord =
        serde_json::from_slice(&raw.data).map_err(|source| RecordDecodeError::Malformed {
            sequence_number: raw.sequence_number.clone(),
            source,
        })?;

    if record.device_id.trim().is_empty() {
        return Err(RecordDecodeError::MissingDeviceId {
            sequence_number: raw.sequence_number.clone(),
        });
    }

    for sample in &record.samples {
        check_epoch_seconds(raw, sample.unix_time)?;
    }

    Ok(record)
}

/// Timestamps are multiplied into epoch milliseconds downstream.
fn check_epoch_seconds(raw: &RawRecord, seconds: i64) -> Result<(), RecordDecodeError> {
    match seconds.checked_mul(1000) {
        Some(_) => Ok(()),
        None => Err(RecordDecodeError::TimestampOutOfRange {
            sequence_number: raw.sequence_number.clone(),
            seconds,
        }),
    }
}

#[derive(Deserialize)]
struct PillBatch {
    #[serde(default)]
    pills: Vec<PillHeartbeat>,
}

/// Decodes a batched pill upload. Heartbeats without a device id are dropped
/// rather than failing the whole record.
pub fn decode_pill_batch(raw: &RawRecord) -> Result<Vec<PillHeartbeat>, RecordDecodeError> {
    if raw.data.is_empty() {
        return Err(RecordDecodeError::EmptyPayload {
            sequence_number: raw.sequence_number.clone(),
        });
    }

    let batch: PillBatch =
        serde_json::from_slice(&raw.data).map_err(|source| RecordDecodeError::Malformed {
            sequence_number: raw.sequence_number.clone(),
            source,
        })?;

    for pill in &batch.pills {
        check_epoch_seconds(raw, pill.timestamp)?;
    }

    Ok(batch
        .pills
        .into_iter()
        .filter(|p| !p.device_id.trim().is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: &str) -> RawRecord {
        RawRecord::new("42", "sense-1", data.as_bytes().to_vec())
    }

    #[test]
    fn decodes_flattened_sensor_readings() {
        let record = decode_sense_record(&raw(
            r#"{"device_id":"sense-1","received_at":1000,"uptime_seconds":12,
                "samples":[{"unix_time":5,"co2":900,"humidity":4500}]}"#,
        ))
        .unwrap();

        assert_eq!(record.device_id, "sense-1");
        assert_eq!(record.samples.len(), 1);
        assert_eq!(record.samples[0].readings.co2, Some(900));
        assert_eq!(record.samples[0].readings.humidity, Some(4500));
        assert_eq!(record.samples[0].readings.dust, None);
    }

    #[test]
    fn malformed_payload_carries_the_sequence_number() {
        let err = decode_sense_record(&raw("{not json")).unwrap_err();
        assert!(matches!(err, RecordDecodeError::Malformed { ref sequence_number, .. } if sequence_number == "42"));
    }

    #[test]
    fn blank_device_id_is_rejected() {
        let err = decode_sense_record(&raw(r#"{"device_id":" ","received_at":1}"#)).unwrap_err();
        assert!(matches!(err, RecordDecodeError::MissingDeviceId { .. }));
    }

    #[test]
    fn overflowing_sample_time_is_rejected() {
        let err = decode_sense_record(&raw(
            r#"{"device_id":"sense-1","received_at":1000,
                "samples":[{"unix_time":1709650000},{"unix_time":9300000000000000}]}"#,
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            RecordDecodeError::TimestampOutOfRange { seconds: 9_300_000_000_000_000, .. }
        ));

        let err = decode_pill_batch(&raw(r#"{"pills":[{"device_id":"pill-1","timestamp":-9300000000000000}]}"#))
            .unwrap_err();
        assert!(matches!(err, RecordDecodeError::TimestampOutOfRange { .. }));
    }

    #[test]
    fn pill_batch_drops_anonymous_heartbeats() {
        let pills = decode_pill_batch(&raw(
            r#"{"pills":[{"device_id":"pill-1","timestamp":10},{"device_id":"","timestamp":11}]}"#,
        ))
        .unwrap();
        assert_eq!(pills, vec![PillHeartbeat { device_id: "pill-1".into(), timestamp: 10 }]);
    }
}
