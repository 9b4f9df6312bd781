//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use treeprefetch::block::{
    Block, BlockId, BlockInfo, BlockPointer, CacheLifetime, DirBlock, DirEntry, EntryType,
    FileBlock, KeyMetadata, VolumeId,
};
use treeprefetch::cache::{
    BlockCache, BlockRequest, BlockRetriever, BoxFuture, Clock, DiskBlockCache, Reporter,
    RequestScope, RetrievalReceiver, RetrievalResult, SpaceCheck,
};
use treeprefetch::error::{CacheError, FaultHandler, InvariantViolation, RetrievalError};
use treeprefetch::progress::{DiskSpaceStatus, SyncStatusSnapshot};
use treeprefetch::{CacheKind, CompletionSignal, PrefetchAction, PrefetchStatus, Prefetcher, Priority};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Block builders
// ============================================================================

pub fn pointer(seed: &str) -> BlockPointer {
    BlockPointer::new(BlockId::for_content(seed.as_bytes()))
}

pub fn kmd(volume: u64) -> KeyMetadata {
    KeyMetadata::new(VolumeId(volume), 1)
}

/// A direct file block, which is always a tail.
pub fn leaf(seed: &str, size: u32) -> (BlockInfo, Block) {
    let block = Block::File(FileBlock::direct(Bytes::copy_from_slice(seed.as_bytes()), size));
    (BlockInfo::new(pointer(seed), size), block)
}

pub fn indirect_file(children: &[BlockInfo], size: u32) -> Block {
    Block::File(FileBlock::indirect(children.to_vec(), size))
}

pub fn directory(entries: &[(&str, BlockInfo)], size: u32) -> Block {
    let children = entries
        .iter()
        .map(|(name, info)| {
            let entry = DirEntry::new(*info, EntryType::File, u64::from(info.encoded_size));
            (name.to_string(), entry)
        })
        .collect();
    Block::Dir(DirBlock::direct(children, size))
}

// ============================================================================
// Scripted retriever
// ============================================================================

struct Held {
    request: BlockRequest,
    reply: oneshot::Sender<RetrievalResult>,
}

#[derive(Default)]
struct ScriptedState {
    blocks: HashMap<BlockId, Arc<Block>>,
    cached: HashMap<BlockId, Arc<Block>>,
    statuses: HashMap<BlockId, PrefetchStatus>,
    requests: Vec<BlockRequest>,
    held: HashMap<BlockId, Vec<Held>>,
}

/// Retriever that records every request and holds tracked ones until the
/// test releases them. It also acts as the memory block cache.
///
/// Untracked requests (the dispatch loop's own block fetches) are answered
/// at once from the store.
#[derive(Clone, Default)]
pub struct ScriptedRetriever {
    state: Arc<Mutex<ScriptedState>>,
    prefetcher: Arc<Mutex<Option<Prefetcher>>>,
}

impl ScriptedRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, prefetcher: Prefetcher) {
        *self.prefetcher.lock() = Some(prefetcher);
    }

    pub fn detach(&self) {
        self.prefetcher.lock().take();
    }

    pub fn insert(&self, pointer: BlockPointer, block: Block) {
        self.state.lock().blocks.insert(pointer.id, Arc::new(block));
    }

    pub fn block(&self, pointer: BlockPointer) -> Arc<Block> {
        Arc::clone(&self.state.lock().blocks[&pointer.id])
    }

    /// Number of retrievals issued for the block.
    pub fn requests_for(&self, pointer: BlockPointer) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.pointer.id == pointer.id)
            .count()
    }

    pub fn tracked_requests(&self) -> Vec<BlockRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.action.prefetch_tracked())
            .cloned()
            .collect()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.values().map(Vec::len).sum()
    }

    pub fn held_pointers(&self) -> Vec<BlockPointer> {
        self.state
            .lock()
            .held
            .values()
            .flatten()
            .map(|h| h.request.pointer)
            .collect()
    }

    pub fn status(&self, pointer: BlockPointer) -> Option<PrefetchStatus> {
        self.state.lock().statuses.get(&pointer.id).copied()
    }

    /// Completes every held retrieval of the block, reporting each one to
    /// the prefetcher first.
    pub async fn release(&self, pointer: BlockPointer) {
        let held = self.state.lock().held.remove(&pointer.id).unwrap_or_default();
        for Held { request, reply } in held {
            let (block, status) = {
                let mut state = self.state.lock();
                let block = Arc::clone(&state.blocks[&request.pointer.id]);
                state.cached.insert(request.pointer.id, Arc::clone(&block));
                let status = state
                    .statuses
                    .get(&request.pointer.id)
                    .copied()
                    .unwrap_or(PrefetchStatus::NoPrefetch);
                (block, status)
            };
            let prefetcher = self.prefetcher.lock().clone();
            if let Some(prefetcher) = prefetcher {
                prefetcher
                    .process_block_for_prefetch(
                        request.pointer,
                        Arc::clone(&block),
                        request.kmd.clone(),
                        request.priority,
                        request.lifetime,
                        status,
                        request.action,
                    )
                    .await;
            }
            let _ = reply.send(Ok(block));
        }
    }

    pub async fn release_all(&self) {
        for pointer in self.held_pointers() {
            self.release(pointer).await;
        }
    }

    /// Fails every held retrieval of the block.
    pub fn fail(&self, pointer: BlockPointer) {
        let held = self.state.lock().held.remove(&pointer.id).unwrap_or_default();
        for Held { reply, .. } in held {
            let _ = reply.send(Err(RetrievalError::Failed("injected".into())));
        }
    }
}

impl BlockRetriever for ScriptedRetriever {
    fn request(&self, _scope: RequestScope, request: BlockRequest) -> RetrievalReceiver {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if request.action.prefetch_tracked() {
            state
                .held
                .entry(request.pointer.id)
                .or_default()
                .push(Held { request, reply: tx });
            return rx;
        }
        let result = match state.blocks.get(&request.pointer.id) {
            Some(block) => {
                let block = Arc::clone(block);
                state.cached.insert(request.pointer.id, Arc::clone(&block));
                Ok(block)
            }
            None => Err(RetrievalError::NotFound(request.pointer.id)),
        };
        let _ = tx.send(result);
        rx
    }

    fn put_in_caches<'a>(
        &'a self,
        _scope: &'a RequestScope,
        pointer: BlockPointer,
        _volume: VolumeId,
        block: Arc<Block>,
        _lifetime: CacheLifetime,
        status: PrefetchStatus,
        _kind: CacheKind,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.cached.insert(pointer.id, block);
            let current = state.statuses.entry(pointer.id).or_insert(PrefetchStatus::NoPrefetch);
            *current = current.advance(status);
            Ok(())
        })
    }
}

impl BlockCache for ScriptedRetriever {
    fn get<'a>(
        &'a self,
        pointer: &'a BlockPointer,
    ) -> BoxFuture<'a, Result<Option<Arc<Block>>, CacheError>> {
        Box::pin(async move { Ok(self.state.lock().cached.get(&pointer.id).cloned()) })
    }
}

// ============================================================================
// Disk cache with switchable capacity
// ============================================================================

/// Disk cache whose sync partition can be flipped between full and empty.
pub struct SwitchableDisk {
    has_room: AtomicBool,
    checks: AtomicUsize,
    metadata: Mutex<Vec<(BlockId, PrefetchStatus)>>,
}

impl SwitchableDisk {
    pub fn new(has_room: bool) -> Self {
        Self {
            has_room: AtomicBool::new(has_room),
            checks: AtomicUsize::new(0),
            metadata: Mutex::new(Vec::new()),
        }
    }

    pub fn set_has_room(&self, has_room: bool) {
        self.has_room.store(has_room, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn metadata_updates(&self) -> Vec<(BlockId, PrefetchStatus)> {
        self.metadata.lock().clone()
    }
}

impl DiskBlockCache for SwitchableDisk {
    fn does_cache_have_space(&self, _kind: CacheKind) -> BoxFuture<'_, Result<SpaceCheck, CacheError>> {
        Box::pin(async move {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let has_room = self.has_room.load(Ordering::SeqCst);
            Ok(SpaceCheck {
                has_room,
                headroom: if has_room { u64::MAX } else { 0 },
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
            self.metadata.lock().push((id, status));
            Ok(())
        })
    }

    fn space_status(&self, _kind: CacheKind) -> DiskSpaceStatus {
        DiskSpaceStatus::default()
    }
}

// ============================================================================
// Clock, reporter and fault handler
// ============================================================================

pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    snapshots: Mutex<Vec<SyncStatusSnapshot>>,
}

impl RecordingReporter {
    pub fn snapshots(&self) -> Vec<SyncStatusSnapshot> {
        self.snapshots.lock().clone()
    }
}

impl Reporter for RecordingReporter {
    fn notify_overall_sync_status(&self, snapshot: SyncStatusSnapshot) {
        self.snapshots.lock().push(snapshot);
    }
}

#[derive(Default)]
pub struct RecordingFaults {
    violations: Mutex<Vec<InvariantViolation>>,
}

impl RecordingFaults {
    pub fn violations(&self) -> Vec<InvariantViolation> {
        self.violations.lock().clone()
    }
}

impl FaultHandler for RecordingFaults {
    fn on_invariant_violation(&self, violation: &InvariantViolation) {
        self.violations.lock().push(violation.clone());
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Hands a block to the prefetcher the way a retriever would after an
/// on-demand read.
pub async fn trigger(
    prefetcher: &Prefetcher,
    retriever: &ScriptedRetriever,
    pointer: BlockPointer,
    kmd: KeyMetadata,
    action: PrefetchAction,
) {
    let block = retriever.block(pointer);
    let status = retriever.status(pointer).unwrap_or(PrefetchStatus::NoPrefetch);
    prefetcher
        .process_block_for_prefetch(
            pointer,
            block,
            kmd,
            Priority::ON_DEMAND,
            CacheLifetime::Transient,
            status,
            action,
        )
        .await;
}

/// Returns the wait signal once every event queued before the call has
/// been handled.
pub async fn wait_signal(prefetcher: &Prefetcher, pointer: BlockPointer) -> CompletionSignal {
    let token = tokio_util::sync::CancellationToken::new();
    prefetcher
        .wait_channel_for_block_prefetch(&token, pointer)
        .await
        .unwrap()
}

pub async fn closes(signal: &CompletionSignal) {
    tokio::time::timeout(WAIT, signal.wait())
        .await
        .expect("wait signal did not close");
}
