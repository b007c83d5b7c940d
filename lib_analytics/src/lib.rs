//! # lib_analytics
//!
//! The per-shard processing core shared by the `sense_stats` and `pill_stats`
//! workers. A streaming coordinator hands each shard's records to exactly one
//! processor at a time; the processor folds them into per-device aggregates,
//! counts low-uptime reboots, gates checkpoint advances and flags implausible
//! sensor readings.
//!
//! ## Modules:
//!
//! - **`models`**: decoded telemetry records, samples and per-batch aggregates.
//! - **`decode`**: opaque stream records and the per-record decoders.
//! - **`membership`**: the rotating bloom filter used for reboot dedup.
//! - **`checkpoint_gate`**: rate limiting for checkpoint advances.
//! - **`anomaly`**: static threshold checks over sensor readings.
//! - **`aggregator`**: the one-batch device aggregator.
//! - **`settings`**: processor tunables and their validation.
//! - **`sinks`**: the atomic write contract and its Redis/in-memory backends.
//! - **`processors`**: the sense and pill shard processors.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod aggregator;
pub mod anomaly;
pub mod checkpoint_gate;
pub mod decode;
pub mod errors;
pub mod membership;
pub mod models;
pub mod processors;
pub mod settings;
pub mod sinks;

// --- Public API Re-exports ---
pub use aggregator::WindowedAggregator;
pub use anomaly::{AnomalyCounters, AnomalyKind, SensorThresholds, ThresholdAnomalyDetector};
pub use checkpoint_gate::CheckpointGate;
pub use decode::RawRecord;
pub use errors::{
    CheckpointCommitError, ConfigurationError, ProcessorStateError, RecordDecodeError,
    SinkWriteError,
};
pub use membership::RotatingMembershipFilter;
pub use models::{DeviceAggregate, DeviceAggregates, DeviceClass, Sample, TelemetryRecord};
pub use processors::{
    BatchOutcome, Checkpointer, Clock, PillShardProcessor, ProcessorCounters, ProcessorState,
    ShardProcessor, ShutdownReason, SystemClock,
};
pub use settings::ProcessorSettings;
pub use sinks::{AggregateSink, CheckpointTrail, MemorySink, StoreOp, WriteBatch};

#[cfg(feature = "connections")]
pub use sinks::redis_sink::RedisAggregateSink;
