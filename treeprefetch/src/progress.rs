//! Progress records and the snapshots published to status observers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Clock;

/// Bytes fetched for a block tree, the known total, and when it started.
///
/// The total grows as more of the tree is discovered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchProgress {
    pub bytes_fetched: u64,
    pub bytes_total: u64,
    pub start: Option<DateTime<Utc>>,
}

impl PrefetchProgress {
    pub fn new(bytes_total: u64, start: DateTime<Utc>) -> Self {
        Self {
            bytes_fetched: 0,
            bytes_total,
            start: Some(start),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_fetched == self.bytes_total
    }

    /// Converts to the wire progress, extrapolating an end time from the
    /// fraction fetched so far.
    pub fn to_protocol_progress(&self, clock: &dyn Clock) -> ProtocolProgress {
        let mut out = ProtocolProgress {
            start: self.start,
            end_estimate: None,
            bytes_total: self.bytes_total,
            bytes_fetched: self.bytes_fetched,
        };

        let start = match self.start {
            Some(start) if self.bytes_total > 0 && self.bytes_fetched > 0 => start,
            _ => return out,
        };

        let running_ms = (clock.now() - start).num_milliseconds().max(0) as f64;
        let fraction_done = self.bytes_fetched as f64 / self.bytes_total as f64;
        let total_estimate_ms = (running_ms / fraction_done) as i64;
        out.end_estimate = Some(start + ChronoDuration::milliseconds(total_estimate_ms));
        out
    }

    /// Never reports `NotStarted`: a progress record only exists once a
    /// prefetch has begun.
    pub fn to_protocol_status(&self) -> ProtocolPrefetchStatus {
        if self.bytes_total == 0 || self.bytes_fetched == self.bytes_total {
            ProtocolPrefetchStatus::Complete
        } else {
            ProtocolPrefetchStatus::InProgress
        }
    }
}

/// Prefetch progress in the form sent to the status service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProgress {
    pub start: Option<DateTime<Utc>>,
    pub end_estimate: Option<DateTime<Utc>>,
    pub bytes_total: u64,
    pub bytes_fetched: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolPrefetchStatus {
    NotStarted,
    InProgress,
    Complete,
}

/// Space figures for one disk cache partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpaceStatus {
    pub limit_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Snapshot of the aggregate sync progress handed to the [`Reporter`](crate::cache::Reporter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub status: ProtocolPrefetchStatus,
    pub progress: ProtocolProgress,
    /// `None` when no disk cache is configured.
    pub disk: Option<DiskSpaceStatus>,
    /// Set when the sync cache dropped below its low-space threshold.
    pub low_space: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn test_end_estimate_extrapolates() {
        let progress = PrefetchProgress {
            bytes_fetched: 25,
            bytes_total: 100,
            start: Some(at(0)),
        };
        let out = progress.to_protocol_progress(&FixedClock(at(10)));
        assert_eq!(out.bytes_fetched, 25);
        assert_eq!(out.bytes_total, 100);
        assert_eq!(out.end_estimate, Some(at(40)));
    }

    #[test]
    fn test_no_estimate_without_fetched_bytes() {
        let progress = PrefetchProgress::new(100, at(0));
        let out = progress.to_protocol_progress(&FixedClock(at(10)));
        assert_eq!(out.end_estimate, None);
        assert_eq!(out.start, Some(at(0)));
    }

    #[test]
    fn test_protocol_status() {
        let mut progress = PrefetchProgress::new(10, at(0));
        assert_eq!(progress.to_protocol_status(), ProtocolPrefetchStatus::InProgress);
        progress.bytes_fetched = 10;
        assert_eq!(progress.to_protocol_status(), ProtocolPrefetchStatus::Complete);
        assert_eq!(
            PrefetchProgress::default().to_protocol_status(),
            ProtocolPrefetchStatus::Complete
        );
    }
}
