//! Collaborator interfaces consumed by the prefetch engine.
//!
//! The engine never fetches, decrypts or stores blocks itself. It drives
//! these narrow interfaces instead:
//!
//! - [`BlockRetriever`]: issues block fetches and writes fetched blocks to
//!   the caches
//! - [`BlockCache`]: fast in-memory lookups
//! - [`DiskBlockCache`]: capacity checks and persisted prefetch status
//! - [`Clock`], [`Reporter`], [`SettingsDb`]: time, status publication and
//!   per-volume settings
//!
//! All traits are dyn-compatible and use [`BoxFuture`] for async methods so
//! the engine can hold them as `Arc<dyn Trait>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::{CacheKind, PrefetchAction, PrefetchStatus};
use crate::block::{Block, BlockId, BlockKind, BlockPointer, CacheLifetime, KeyMetadata, VolumeId};
use crate::error::{CacheError, RetrievalError};
use crate::prefetch::Priority;
use crate::progress::{DiskSpaceStatus, SyncStatusSnapshot};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one block retrieval.
pub type RetrievalResult = Result<Arc<Block>, RetrievalError>;

/// Receives the outcome of one block retrieval.
pub type RetrievalReceiver = oneshot::Receiver<RetrievalResult>;

/// Cancellation scope and deadline a retrieval runs under.
///
/// Each prefetch node owns one scope; cancelling the node cancels every
/// retrieval issued under it.
#[derive(Clone, Debug)]
pub struct RequestScope {
    token: CancellationToken,
    deadline: Instant,
}

impl RequestScope {
    pub fn new(token: CancellationToken, deadline: Instant) -> Self {
        Self { token, deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the scope is cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }
}

/// Everything a retriever needs to fetch one block.
#[derive(Clone, Debug)]
pub struct BlockRequest {
    pub priority: Priority,
    pub kmd: KeyMetadata,
    pub pointer: BlockPointer,
    /// Kind of block expected at the pointer.
    pub kind: BlockKind,
    pub lifetime: CacheLifetime,
    pub action: PrefetchAction,
}

/// Fetches blocks and writes them into the caches.
///
/// When a request's action is tracked by the prefetcher
/// ([`PrefetchAction::prefetch_tracked`]), a successful retrieval must be
/// reported back through
/// [`Prefetcher::process_block_for_prefetch`](crate::prefetch::Prefetcher::process_block_for_prefetch)
/// with [`PrefetchStatus::NoPrefetch`] (or the status already cached for
/// the block).
pub trait BlockRetriever: Send + Sync {
    /// Starts fetching a block. Never blocks; the outcome arrives on the
    /// returned receiver.
    fn request(&self, scope: RequestScope, request: BlockRequest) -> RetrievalReceiver;

    /// Writes a block into the memory and disk caches with the given status.
    #[allow(clippy::too_many_arguments)]
    fn put_in_caches<'a>(
        &'a self,
        scope: &'a RequestScope,
        pointer: BlockPointer,
        volume: VolumeId,
        block: Arc<Block>,
        lifetime: CacheLifetime,
        status: PrefetchStatus,
        kind: CacheKind,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Fast in-memory block cache.
pub trait BlockCache: Send + Sync {
    /// Returns `Ok(None)` when the block is not cached.
    fn get<'a>(&'a self, pointer: &'a BlockPointer)
        -> BoxFuture<'a, Result<Option<Arc<Block>>, CacheError>>;
}

/// Result of a disk cache capacity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceCheck {
    pub has_room: bool,
    /// Estimated bytes still available in the partition.
    pub headroom: u64,
}

/// Space-accounted on-disk block cache.
pub trait DiskBlockCache: Send + Sync {
    fn does_cache_have_space(&self, kind: CacheKind) -> BoxFuture<'_, Result<SpaceCheck, CacheError>>;

    /// Records the prefetch status of a cached block.
    fn update_metadata(
        &self,
        volume: VolumeId,
        id: BlockId,
        status: PrefetchStatus,
        kind: CacheKind,
    ) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Current space figures for a partition.
    fn space_status(&self, kind: CacheKind) -> DiskSpaceStatus;
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Publishes aggregate sync progress to observers.
pub trait Reporter: Send + Sync {
    fn notify_overall_sync_status(&self, snapshot: SyncStatusSnapshot);
}

/// Persisted per-volume sync settings.
pub trait SettingsDb: Send + Sync {
    /// Low-space notification threshold for the volume's sync cache, if one
    /// was configured.
    fn space_notification_threshold(&self, volume: VolumeId) -> Option<u64>;
}
