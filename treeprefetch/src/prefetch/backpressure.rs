//! Cache-capacity checks made before committing more prefetch work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::action::CacheKind;
use crate::cache::{DiskBlockCache, SettingsDb, SpaceCheck};
use crate::prefetch::overall::OverallProgress;
use crate::prefetch::request::PrefetchRequest;

/// What to do with a request after checking cache headroom.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopDecision {
    Proceed,
    /// The sync cache is full: retry the top block later.
    Reschedule,
    /// Stop here, cancelling the pointer's subtree when `cancel` is set.
    Stop { cancel: bool },
}

pub(crate) struct Backpressure {
    disk_cache: Option<Arc<dyn DiskBlockCache>>,
    settings: Option<Arc<dyn SettingsDb>>,
    default_threshold: u64,
    overall: Arc<OverallProgress>,
    low_space_notified: AtomicBool,
}

impl Backpressure {
    pub fn new(
        disk_cache: Option<Arc<dyn DiskBlockCache>>,
        settings: Option<Arc<dyn SettingsDb>>,
        default_threshold: u64,
        overall: Arc<OverallProgress>,
    ) -> Self {
        Self {
            disk_cache,
            settings,
            default_threshold,
            overall,
            low_space_notified: AtomicBool::new(false),
        }
    }

    /// Checks whether the destination cache of `request` has room.
    ///
    /// Without a disk cache, or when the check itself fails, work proceeds.
    pub async fn check(&self, request: &PrefetchRequest) -> StopDecision {
        let Some(disk_cache) = self.disk_cache.as_ref() else {
            return StopDecision::Proceed;
        };
        let kind = request.action.cache_kind();
        let space = match disk_cache.does_cache_have_space(kind).await {
            Ok(space) => space,
            Err(e) => {
                debug!(block = %request.pointer, error = %e, "Error checking cache space");
                return StopDecision::Proceed;
            }
        };

        if space.has_room {
            if kind == CacheKind::Sync {
                self.note_headroom(request, space);
            }
            return StopDecision::Proceed;
        }

        let decision = if request.action.sync() {
            StopDecision::Reschedule
        } else if request.action.stop_if_full() {
            StopDecision::Stop { cancel: true }
        } else {
            StopDecision::Proceed
        };
        if decision != StopDecision::Proceed {
            debug!(
                block = %request.pointer,
                sync = request.action.sync(),
                "Stopping prefetch due to full cache"
            );
        }
        decision
    }

    /// Sends the low-space notification once per dip below the threshold.
    fn note_headroom(&self, request: &PrefetchRequest, space: SpaceCheck) {
        let threshold = self
            .settings
            .as_ref()
            .and_then(|s| s.space_notification_threshold(request.volume()))
            .unwrap_or(self.default_threshold);

        if space.headroom < threshold {
            if !self.low_space_notified.swap(true, Ordering::AcqRel) {
                debug!(
                    headroom = space.headroom,
                    threshold, "Sync cache is running low on space"
                );
                self.overall.notify_low_space();
            }
        } else {
            self.low_space_notified.store(false, Ordering::Release);
        }
    }
}
