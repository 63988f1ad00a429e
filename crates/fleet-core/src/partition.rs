//! Partition key-range intervals and worker-id derivation.
//!
//! The key space is the fixed range `[0, 65535]`. A role with `n`
//! partitions splits it into `n` contiguous intervals: every interval gets
//! `65536 / n` keys and the first `65536 % n` intervals get one extra.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Highest key in the partition key space (inclusive).
pub const KEY_RANGE_MAX: u32 = 65535;

const KEY_SPACE: u32 = KEY_RANGE_MAX + 1;

/// An inclusive `[from, to]` key interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub from: u32,
    pub to: u32,
}

impl KeyRange {
    /// Number of keys in the interval.
    pub fn key_count(&self) -> u32 {
        self.to - self.from + 1
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self {
            from: 0,
            to: KEY_RANGE_MAX,
        }
    }
}

/// Split the key space into `count` intervals, equal-split with remainder.
pub fn partition_intervals(count: u32) -> ConfigResult<Vec<KeyRange>> {
    if count == 0 || count > KEY_SPACE {
        return Err(ConfigError::UnsupportedConfig(format!(
            "partition count must be within 1..={KEY_SPACE}, got {count}"
        )));
    }

    let base = KEY_SPACE / count;
    let remainder = KEY_SPACE % count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut from = 0u32;
    for index in 0..count {
        let size = if index < remainder { base + 1 } else { base };
        let to = from + size - 1;
        ranges.push(KeyRange { from, to });
        from = to + 1;
    }
    Ok(ranges)
}

/// Deterministic worker id for one (replica, partition) slot of a role.
pub fn worker_id(role: &str, replica: u32, partition: u32, range: KeyRange) -> String {
    format!("{role}_{replica}_{partition}_{}_{}", range.from, range.to)
}
