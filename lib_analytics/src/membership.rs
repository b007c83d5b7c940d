//! # Rotating Membership Filter
//!
//! A bloom filter over device ids that is thrown away and rebuilt once it is
//! older than the rotation period. Membership answers are approximate (no
//! false negatives, bounded false positives) but memory stays fixed no matter
//! how many devices pass through a shard.

use bloomfilter::Bloom;

/// Devices a single shard is expected to see within one rotation.
pub const EXPECTED_ITEMS: usize = 20_000;
/// Tolerated false-positive rate at `EXPECTED_ITEMS`.
pub const FALSE_POSITIVE_RATE: f64 = 0.03;
/// Age after which the filter is discarded.
pub const ROTATION_PERIOD_MS: i64 = 60 * 60 * 1000;

pub struct RotatingMembershipFilter {
    filter: Bloom<str>,
    /// Epoch ms at which the current filter was allocated.
    created_at: i64,
}

impl RotatingMembershipFilter {
    pub fn new(now_millis: i64) -> Self {
        Self {
            filter: fresh_filter(),
            created_at: now_millis,
        }
    }

    pub fn might_contain(&self, key: &str) -> bool {
        self.filter.check(key)
    }

    pub fn insert(&mut self, key: &str) {
        self.filter.set(key);
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Swaps in an empty filter when the current one has outlived the
    /// rotation period. Returns whether a rotation happened.
    pub fn rotate_if_expired(&mut self, now_millis: i64) -> bool {
        if now_millis.saturating_sub(self.created_at) <= ROTATION_PERIOD_MS {
            return false;
        }

        self.filter = fresh_filter();
        log::debug!(
            "action=membership-filter-rotated age_ms={}",
            now_millis - self.created_at
        );
        self.created_at = now_millis;
        true
    }
}

fn fresh_filter() -> Bloom<str> {
    Bloom::new_for_fp_rate(EXPECTED_ITEMS, FALSE_POSITIVE_RATE)
}

impl std::fmt::Debug for RotatingMembershipFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingMembershipFilter")
            .field("created_at", &self.created_at)
            .field("expected_items", &EXPECTED_ITEMS)
            .field("false_positive_rate", &FALSE_POSITIVE_RATE)
            .finish()
    }
}
