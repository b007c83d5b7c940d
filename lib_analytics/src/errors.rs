//! # Error Taxonomy
//!
//! Every failure the core can observe at runtime is recoverable per record or
//! per batch. Only `ConfigurationError` is fatal, and only at startup.

use thiserror::Error;

use crate::processors::ProcessorState;

/// A single stream record could not be turned into a telemetry record.
/// The record is skipped; the rest of the batch continues.
#[derive(Debug, Error)]
pub enum RecordDecodeError {
    #[error("record {sequence_number} has an empty payload")]
    EmptyPayload { sequence_number: String },

    #[error("record {sequence_number} is malformed: {source}")]
    Malformed {
        sequence_number: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {sequence_number} carries no device id")]
    MissingDeviceId { sequence_number: String },

    #[error("record {sequence_number} has timestamp {seconds}s outside the epoch millisecond range")]
    TimestampOutOfRange { sequence_number: String, seconds: i64 },
}

/// The atomic multi-op write to the aggregate store failed as a unit.
#[derive(Debug, Error)]
pub enum SinkWriteError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("atomic write rejected: {0}")]
    Rejected(String),

    #[error("store write timed out after {0} ms")]
    Timeout(u64),
}

/// The coordinator refused to record the checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointCommitError {
    #[error("lease for shard {0} is no longer held by this worker")]
    LeaseLost(String),

    #[error("no position has been delivered for shard {0}")]
    NothingToCommit(String),

    #[error("checkpoint store error: {0}")]
    Store(String),
}

/// Invalid tunables. Raised while building processors, never while running them.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid bounds for {sensor}: low {low} must be below high {high}")]
    InvertedBounds { sensor: &'static str, low: i64, high: i64 },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// A lifecycle call arrived in a state that does not accept it.
#[derive(Debug, Error)]
pub enum ProcessorStateError {
    #[error("cannot {action} while the processor is {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: ProcessorState,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
