//! In-memory collaborators.
//!
//! [`MemoryBlockCache`] wraps `moka::future::Cache`, weighted by each
//! block's encoded size. [`MemoryDiskCache`] stands in for the on-disk
//! cache: it only accounts bytes per partition and remembers prefetch
//! statuses, which is all the engine ever asks of it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::action::{CacheKind, PrefetchStatus};
use crate::block::{Block, BlockId, BlockPointer, VolumeId};
use crate::cache::traits::{BlockCache, BoxFuture, Clock, DiskBlockCache, Reporter, SpaceCheck};
use crate::error::CacheError;
use crate::progress::{DiskSpaceStatus, SyncStatusSnapshot};

/// Default memory cache budget (64 MiB).
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// Memory Block Cache
// =============================================================================

/// Block cache backed by moka with size-weighted LRU eviction.
pub struct MemoryBlockCache {
    cache: MokaCache<BlockPointer, Arc<Block>>,
}

impl MemoryBlockCache {
    pub fn new(max_size_bytes: u64) -> Self {
        let cache = MokaCache::builder()
            .weigher(|_key: &BlockPointer, block: &Arc<Block>| -> u32 {
                block.encoded_size().max(1)
            })
            .max_capacity(max_size_bytes)
            .build();
        Self { cache }
    }

    pub async fn put(&self, pointer: BlockPointer, block: Arc<Block>) {
        self.cache.insert(pointer, block).await;
    }

    pub async fn remove(&self, pointer: &BlockPointer) {
        self.cache.remove(pointer).await;
    }

    pub fn contains(&self, pointer: &BlockPointer) -> bool {
        self.cache.contains_key(pointer)
    }
}

impl Default for MemoryBlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CACHE_BYTES)
    }
}

impl BlockCache for MemoryBlockCache {
    fn get<'a>(
        &'a self,
        pointer: &'a BlockPointer,
    ) -> BoxFuture<'a, Result<Option<Arc<Block>>, CacheError>> {
        Box::pin(async move { Ok(self.cache.get(pointer).await) })
    }
}

// =============================================================================
// Memory Disk Cache
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct StoredBlock {
    volume: VolumeId,
    size: u64,
    status: PrefetchStatus,
    kind: CacheKind,
}

#[derive(Debug, Default)]
struct Partition {
    limit: u64,
    used: u64,
}

impl Partition {
    fn status(&self) -> DiskSpaceStatus {
        DiskSpaceStatus {
            limit_bytes: self.limit,
            used_bytes: self.used,
            free_bytes: self.limit.saturating_sub(self.used),
        }
    }
}

#[derive(Debug, Default)]
struct DiskState {
    sync: Partition,
    working: Partition,
    blocks: HashMap<BlockId, StoredBlock>,
}

impl DiskState {
    fn partition(&mut self, kind: CacheKind) -> &mut Partition {
        match kind {
            CacheKind::Sync => &mut self.sync,
            CacheKind::Any | CacheKind::WorkingSet => &mut self.working,
        }
    }
}

/// Byte-budgeted stand-in for the on-disk block cache.
///
/// Blocks written with [`CacheKind::Sync`] count against the sync budget;
/// everything else counts against the working-set budget.
pub struct MemoryDiskCache {
    state: Mutex<DiskState>,
}

impl MemoryDiskCache {
    pub fn new(sync_limit: u64, working_limit: u64) -> Self {
        let state = DiskState {
            sync: Partition {
                limit: sync_limit,
                used: 0,
            },
            working: Partition {
                limit: working_limit,
                used: 0,
            },
            blocks: HashMap::new(),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// A cache with no practical limit on either partition.
    pub fn unbounded() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }

    /// Stores a block, or advances the status of an already stored one.
    ///
    /// Returns [`CacheError::Full`] when the block does not fit.
    pub fn put(
        &self,
        volume: VolumeId,
        id: BlockId,
        size: u64,
        status: PrefetchStatus,
        kind: CacheKind,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if let Some(stored) = state.blocks.get_mut(&id) {
            stored.status = stored.status.advance(status);
            return Ok(());
        }

        let partition = state.partition(kind);
        if partition.used.saturating_add(size) > partition.limit {
            debug!(block = %id.short(), size, kind = %kind, "disk cache full");
            return Err(CacheError::Full);
        }
        partition.used += size;
        state.blocks.insert(
            id,
            StoredBlock {
                volume,
                size,
                status,
                kind,
            },
        );
        Ok(())
    }

    /// Prefetch status recorded for a block, if the block is stored.
    pub fn prefetch_status(&self, id: &BlockId) -> Option<PrefetchStatus> {
        self.state.lock().blocks.get(id).map(|b| b.status)
    }

    /// Drops every block of a volume and frees its space.
    pub fn evict_volume(&self, volume: VolumeId) -> usize {
        let mut state = self.state.lock();
        let evicted: Vec<(BlockId, StoredBlock)> = state
            .blocks
            .iter()
            .filter(|(_, b)| b.volume == volume)
            .map(|(id, b)| (*id, *b))
            .collect();
        for (id, stored) in &evicted {
            state.blocks.remove(id);
            let partition = state.partition(stored.kind);
            partition.used = partition.used.saturating_sub(stored.size);
        }
        evicted.len()
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }
}

impl DiskBlockCache for MemoryDiskCache {
    fn does_cache_have_space(&self, kind: CacheKind) -> BoxFuture<'_, Result<SpaceCheck, CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let partition = state.partition(kind);
            Ok(SpaceCheck {
                has_room: partition.used < partition.limit,
                headroom: partition.limit.saturating_sub(partition.used),
            })
        })
    }

    fn update_metadata(
        &self,
        _volume: VolumeId,
        id: BlockId,
        status: PrefetchStatus,
        _kind: CacheKind,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            match state.blocks.get_mut(&id) {
                Some(stored) => {
                    stored.status = stored.status.advance(status);
                    Ok(())
                }
                None => Err(CacheError::Other(format!("block {} not cached", id.short()))),
            }
        })
    }

    fn space_status(&self, kind: CacheKind) -> DiskSpaceStatus {
        self.state.lock().partition(kind).status()
    }
}

// =============================================================================
// Clock and Reporter
// =============================================================================

/// Wall-clock time from the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reporter that logs each snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn notify_overall_sync_status(&self, snapshot: SyncStatusSnapshot) {
        info!(
            fetched = snapshot.progress.bytes_fetched,
            total = snapshot.progress.bytes_total,
            status = ?snapshot.status,
            low_space = snapshot.low_space,
            "Overall sync status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlock;
    use bytes::Bytes;

    fn id(seed: &[u8]) -> BlockId {
        BlockId::for_content(seed)
    }

    #[tokio::test]
    async fn test_memory_block_cache_get_put() {
        let cache = MemoryBlockCache::default();
        let ptr = BlockPointer::new(id(b"a"));
        assert!(cache.get(&ptr).await.unwrap().is_none());

        let block = Arc::new(Block::File(FileBlock::direct(Bytes::from_static(b"abc"), 3)));
        cache.put(ptr, block.clone()).await;
        let cached = cache.get(&ptr).await.unwrap();
        assert_eq!(cached.as_deref(), Some(block.as_ref()));
        assert!(cache.contains(&ptr));

        cache.remove(&ptr).await;
        assert!(cache.get(&ptr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_cache_reports_full_sync_partition() {
        let disk = MemoryDiskCache::new(100, 1000);
        disk.put(VolumeId(1), id(b"a"), 60, PrefetchStatus::NoPrefetch, CacheKind::Sync)
            .unwrap();

        let space = disk.does_cache_have_space(CacheKind::Sync).await.unwrap();
        assert!(space.has_room);
        assert_eq!(space.headroom, 40);

        let err = disk
            .put(VolumeId(1), id(b"b"), 50, PrefetchStatus::NoPrefetch, CacheKind::Sync)
            .unwrap_err();
        assert!(matches!(err, CacheError::Full));

        disk.put(VolumeId(1), id(b"c"), 40, PrefetchStatus::NoPrefetch, CacheKind::Sync)
            .unwrap();
        let space = disk.does_cache_have_space(CacheKind::Sync).await.unwrap();
        assert!(!space.has_room);

        let working = disk.does_cache_have_space(CacheKind::Any).await.unwrap();
        assert!(working.has_room);
    }

    #[tokio::test]
    async fn test_disk_cache_status_only_advances() {
        let disk = MemoryDiskCache::unbounded();
        let block = id(b"a");
        disk.put(VolumeId(1), block, 10, PrefetchStatus::Triggered, CacheKind::Any)
            .unwrap();
        disk.update_metadata(VolumeId(1), block, PrefetchStatus::Finished, CacheKind::Any)
            .await
            .unwrap();
        disk.put(VolumeId(1), block, 10, PrefetchStatus::NoPrefetch, CacheKind::Any)
            .unwrap();
        assert_eq!(disk.prefetch_status(&block), Some(PrefetchStatus::Finished));
        assert_eq!(disk.block_count(), 1);
    }

    #[tokio::test]
    async fn test_update_metadata_for_unknown_block_fails() {
        let disk = MemoryDiskCache::unbounded();
        let result = disk
            .update_metadata(VolumeId(1), id(b"x"), PrefetchStatus::Triggered, CacheKind::Sync)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_evict_volume_frees_space() {
        let disk = MemoryDiskCache::new(100, 100);
        disk.put(VolumeId(1), id(b"a"), 30, PrefetchStatus::NoPrefetch, CacheKind::Sync)
            .unwrap();
        disk.put(VolumeId(2), id(b"b"), 20, PrefetchStatus::NoPrefetch, CacheKind::Sync)
            .unwrap();
        assert_eq!(disk.evict_volume(VolumeId(1)), 1);
        assert_eq!(disk.space_status(CacheKind::Sync).used_bytes, 20);
    }
}
