//! The metric backend seam.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One timestamped measurement from a metric backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// When the measurement was taken.
    pub timestamp: DateTime<Utc>,
    /// The measured value.
    pub value: f64,
}

impl Sample {
    /// Creates a sample.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A closed time range for a metric query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive range start.
    pub from: DateTime<Utc>,
    /// Inclusive range end.
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// The range `[now - offset - window, now - offset]`.
    #[must_use]
    pub fn window_ending_at(now: DateTime<Utc>, window: std::time::Duration, offset: std::time::Duration) -> Self {
        let to = now - chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        let from = to - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        Self { from, to }
    }
}

/// A queryable metric backend.
#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
    /// Runs `query` over `range` and returns the matching samples in
    /// whatever order the backend produces them.
    async fn query(&self, query: &str, range: TimeRange) -> Result<Vec<Sample>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn window_is_shifted_backwards_by_offset() {
        let now = Utc::now();
        let range = TimeRange::window_ending_at(now, Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(range.to, now - chrono::Duration::seconds(30));
        assert_eq!(range.from, now - chrono::Duration::seconds(90));
    }

    #[test]
    fn zero_offset_ends_at_now() {
        let now = Utc::now();
        let range = TimeRange::window_ending_at(now, Duration::from_secs(60), Duration::ZERO);
        assert_eq!(range.to, now);
        assert_eq!(range.from, now - chrono::Duration::seconds(60));
    }
}
