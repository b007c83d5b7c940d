//! Worker binaries for the sense and pill telemetry streams.

pub mod stats_logic;
