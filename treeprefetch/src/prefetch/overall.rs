//! Aggregate progress of all sync-flagged prefetches.
//!
//! One counter covers every outstanding sync block. Each request carries a
//! `counted_in_overall` flag so its bytes enter the total once and leave it
//! once, either as fetched bytes or by removal. When a wave of syncing is
//! fully fetched, the next sync byte starts a fresh wave.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::action::CacheKind;
use crate::block::BlockId;
use crate::cache::{Clock, DiskBlockCache, Reporter};
use crate::error::{InvariantViolation, ViolationKind};
use crate::prefetch::request::PrefetchRequest;
use crate::progress::{PrefetchProgress, SyncStatusSnapshot};

#[derive(Debug, Default)]
struct OverallState {
    progress: PrefetchProgress,
    last_published: Option<Instant>,
}

pub(crate) struct OverallProgress {
    state: Mutex<OverallState>,
    reporter: Arc<dyn Reporter>,
    disk_cache: Option<Arc<dyn DiskBlockCache>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl OverallProgress {
    pub fn new(
        reporter: Arc<dyn Reporter>,
        disk_cache: Option<Arc<dyn DiskBlockCache>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(OverallState::default()),
            reporter,
            disk_cache,
            clock,
            interval,
        }
    }

    /// Current aggregate progress.
    pub fn snapshot(&self) -> PrefetchProgress {
        self.state.lock().progress
    }

    /// Adds a sync request's bytes to the total, once.
    pub fn add_total(&self, request: &mut PrefetchRequest) {
        if !request.action.sync() || request.counted_in_overall {
            return;
        }
        let bytes = u64::from(request.encoded_size);
        let published = {
            let mut state = self.state.lock();
            if state.progress.is_complete() {
                state.progress = PrefetchProgress::new(0, self.clock.now());
            }
            state.progress.bytes_total += bytes;
            request.counted_in_overall = true;
            self.publish_decision(&mut state)
        };
        self.publish(published, false);
    }

    /// Takes a counted request's bytes back out of the total.
    pub fn remove_total(&self, request: &mut PrefetchRequest) {
        if !request.action.sync() || !request.counted_in_overall {
            return;
        }
        let bytes = u64::from(request.encoded_size);
        let published = {
            let mut state = self.state.lock();
            state.progress.bytes_total = state.progress.bytes_total.saturating_sub(bytes);
            request.counted_in_overall = false;
            self.publish_decision(&mut state)
        };
        self.publish(published, false);
    }

    /// Counts a counted request's bytes as fetched.
    pub fn add_fetched(&self, request: &mut PrefetchRequest) -> Result<(), InvariantViolation> {
        if !request.action.sync() || !request.counted_in_overall {
            return Ok(());
        }
        let bytes = u64::from(request.encoded_size);
        let published = {
            let mut state = self.state.lock();
            state.progress.bytes_fetched += bytes;
            request.counted_in_overall = false;
            if state.progress.bytes_fetched > state.progress.bytes_total {
                return Err(overall_violation(request.pointer.id, &state.progress));
            }
            self.publish_decision(&mut state)
        };
        self.publish(published, false);
        Ok(())
    }

    /// Publishes immediately with the low-space flag set.
    pub fn notify_low_space(&self) {
        let progress = {
            let mut state = self.state.lock();
            state.last_published = Some(Instant::now());
            state.progress
        };
        self.publish(Some(progress), true);
    }

    /// Decides under the lock whether this change is published.
    fn publish_decision(&self, state: &mut OverallState) -> Option<PrefetchProgress> {
        let due = state
            .last_published
            .map_or(true, |last| last.elapsed() >= self.interval);
        if !state.progress.is_complete() && !due {
            return None;
        }
        state.last_published = Some(Instant::now());
        Some(state.progress)
    }

    fn publish(&self, progress: Option<PrefetchProgress>, low_space: bool) {
        let Some(progress) = progress else {
            return;
        };
        let snapshot = SyncStatusSnapshot {
            status: progress.to_protocol_status(),
            progress: progress.to_protocol_progress(self.clock.as_ref()),
            disk: self.disk_cache.as_ref().map(|d| d.space_status(CacheKind::Sync)),
            low_space,
        };
        trace!(
            fetched = progress.bytes_fetched,
            total = progress.bytes_total,
            "Publishing overall sync status"
        );
        self.reporter.notify_overall_sync_status(snapshot);
    }
}

fn overall_violation(block: BlockId, progress: &PrefetchProgress) -> InvariantViolation {
    InvariantViolation {
        kind: ViolationKind::OverallFetchedExceedsTotal,
        block,
        pending: 0,
        bytes_fetched: progress.bytes_fetched,
        bytes_total: progress.bytes_total,
        parents: Vec::new(),
    }
}
