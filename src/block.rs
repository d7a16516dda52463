use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A position in an upstream partition's history.
///
/// Blocks are ordered by `number`; `id` and `timestamp` only break ties so the
/// ordering stays consistent with equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub number: u64,
    pub timestamp: DateTime<Utc>,
}

impl Block {
    pub fn new(id: impl Into<String>, number: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            number,
            timestamp,
        }
    }

    /// Build a block from a unix timestamp in seconds
    pub fn at_unix(id: impl Into<String>, number: u64, unix_secs: i64) -> Self {
        let timestamp = Utc
            .timestamp_opt(unix_secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self::new(id, number, timestamp)
    }

    /// True when `self` is strictly behind `other`. A missing block is the
    /// beginning of history, so nothing is older than it.
    pub fn is_older_than(&self, other: Option<&Block>) -> bool {
        other.map(|o| self.number < o.number).unwrap_or(false)
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ts: {}",
            self.number,
            self.id,
            self.timestamp.to_rfc3339()
        )
    }
}
