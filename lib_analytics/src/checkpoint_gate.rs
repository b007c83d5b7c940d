//! # Checkpoint Gate
//!
//! Bounds how often a shard records a checkpoint advance, independent of how
//! many samples flow through it. One gate per shard lease, owned and mutated
//! by that shard's processor only.

use std::time::Duration;

use crate::errors::ConfigurationError;

/// Multiple of the track period beyond which a timestamp is treated as corrupt.
pub const MAX_JUMP_PERIODS: i64 = 60;

#[derive(Debug, Clone)]
pub struct CheckpointGate {
    /// Epoch ms of the last advance; 0 until the first one.
    last_checkpointed_at: i64,
    track_period_ms: i64,
}

impl CheckpointGate {
    pub fn new(track_period: Duration) -> Result<Self, ConfigurationError> {
        let track_period_ms = i64::try_from(track_period.as_millis()).map_err(|_| {
            ConfigurationError::InvalidValue {
                name: "checkpoint_track_period",
                reason: "does not fit in epoch milliseconds".to_string(),
            }
        })?;
        if track_period_ms <= 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "checkpoint_track_period",
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self {
            last_checkpointed_at: 0,
            track_period_ms,
        })
    }

    /// True when `timestamp` is more than one track period past the last
    /// advance and less than `MAX_JUMP_PERIODS` periods past it. Before the
    /// first advance the upper bound is measured from `now_millis` instead,
    /// so a single record with a garbage clock cannot seed the gate.
    pub fn is_eligible(&self, timestamp: i64, now_millis: i64) -> bool {
        let lower = self.last_checkpointed_at.saturating_add(self.track_period_ms);
        if timestamp <= lower {
            return false;
        }
        let base = if self.last_checkpointed_at == 0 {
            now_millis
        } else {
            self.last_checkpointed_at
        };
        let upper = base.saturating_add(self.track_period_ms.saturating_mul(MAX_JUMP_PERIODS));
        timestamp < upper
    }

    /// Records an advance. Only call after `is_eligible` returned true.
    pub fn advance(&mut self, timestamp: i64) {
        log::debug!(
            "action=checkpoint-gate-advance delta_ms={}",
            timestamp.saturating_sub(self.last_checkpointed_at)
        );
        self.last_checkpointed_at = timestamp;
    }

    pub fn last_checkpointed_at(&self) -> i64 {
        self.last_checkpointed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60 * 1000;
    const NOW: i64 = 1_700_000_000_000;

    fn five_minute_gate() -> CheckpointGate {
        CheckpointGate::new(Duration::from_secs(5 * 60)).unwrap()
    }

    #[test]
    fn rate_limits_to_one_advance_per_period() {
        let mut gate = five_minute_gate();
        assert!(!gate.is_eligible(4 * MINUTE, NOW));
        assert!(gate.is_eligible(6 * MINUTE, NOW));

        gate.advance(6 * MINUTE);
        assert!(!gate.is_eligible(6 * MINUTE + 1, NOW));
        assert!(!gate.is_eligible(11 * MINUTE, NOW));
        assert!(gate.is_eligible(11 * MINUTE + 1, NOW));
    }

    #[test]
    fn first_real_timestamp_is_accepted() {
        let gate = five_minute_gate();
        assert!(gate.is_eligible(NOW, NOW));
        assert!(gate.is_eligible(NOW - 24 * 60 * MINUTE, NOW));
    }

    #[test]
    fn far_future_first_timestamp_is_rejected() {
        let gate = five_minute_gate();
        // 2100-01-01T00:00:00Z
        assert!(!gate.is_eligible(4_102_444_800_000, NOW));
        assert!(!gate.is_eligible(NOW + 5 * MINUTE * MAX_JUMP_PERIODS, NOW));
        assert!(gate.is_eligible(NOW + 5 * MINUTE * MAX_JUMP_PERIODS - 1, NOW));
        assert!(!gate.is_eligible(i64::MAX, NOW));
    }

    #[test]
    fn implausible_jumps_are_rejected_after_first_advance() {
        let mut gate = five_minute_gate();
        let start = NOW;
        gate.advance(start);

        let later = start + 10 * 365 * 24 * 60 * MINUTE;
        assert!(gate.is_eligible(start + 10 * MINUTE, later));
        assert!(gate.is_eligible(start + 5 * MINUTE * MAX_JUMP_PERIODS - 1, later));
        assert!(!gate.is_eligible(start + 5 * MINUTE * MAX_JUMP_PERIODS, later));
        assert!(!gate.is_eligible(start + 365 * 24 * 60 * MINUTE, later));
    }

    #[test]
    fn zero_period_is_a_configuration_error() {
        assert!(CheckpointGate::new(Duration::ZERO).is_err());
    }
}
