//! Block retriever backed by an in-memory block store.
//!
//! [`StoreRetriever`] serves blocks from a map, writes them through a
//! [`MemoryBlockCache`] and a [`MemoryDiskCache`], and reports tracked
//! retrievals back to the attached [`Prefetcher`]. It drives the
//! command-line simulation and the integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::action::{CacheKind, PrefetchStatus};
use crate::block::{Block, BlockId, BlockPointer, CacheLifetime, VolumeId};
use crate::cache::memory::{MemoryBlockCache, MemoryDiskCache};
use crate::cache::traits::{
    BlockRequest, BlockRetriever, BoxFuture, RequestScope, RetrievalReceiver,
};
use crate::error::{CacheError, RetrievalError};
use crate::prefetch::Prefetcher;

struct StoreInner {
    blocks: RwLock<HashMap<BlockId, Arc<Block>>>,
    block_cache: Arc<MemoryBlockCache>,
    disk_cache: Arc<MemoryDiskCache>,
    prefetcher: Mutex<Option<Prefetcher>>,
    latency: Duration,
}

/// Retriever serving blocks from memory. Clones share the same store.
#[derive(Clone)]
pub struct StoreRetriever {
    inner: Arc<StoreInner>,
}

impl StoreRetriever {
    pub fn new(block_cache: Arc<MemoryBlockCache>, disk_cache: Arc<MemoryDiskCache>) -> Self {
        Self::with_latency(block_cache, disk_cache, Duration::ZERO)
    }

    /// A retriever that delays every retrieval by `latency`.
    pub fn with_latency(
        block_cache: Arc<MemoryBlockCache>,
        disk_cache: Arc<MemoryDiskCache>,
        latency: Duration,
    ) -> Self {
        let inner = StoreInner {
            blocks: RwLock::new(HashMap::new()),
            block_cache,
            disk_cache,
            prefetcher: Mutex::new(None),
            latency,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Connects the prefetcher that tracked retrievals report back to.
    pub fn attach(&self, prefetcher: Prefetcher) {
        *self.inner.prefetcher.lock() = Some(prefetcher);
    }

    /// Drops the prefetcher handle.
    pub fn detach(&self) {
        self.inner.prefetcher.lock().take();
    }

    /// Adds a block to the store, keyed by its pointer's identifier.
    pub fn insert(&self, pointer: BlockPointer, block: Block) {
        self.inner.blocks.write().insert(pointer.id, Arc::new(block));
    }

    pub fn len(&self) -> usize {
        self.inner.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.blocks.read().is_empty()
    }
}

impl StoreInner {
    fn lookup(&self, id: &BlockId) -> Option<Arc<Block>> {
        self.blocks.read().get(id).cloned()
    }
}

impl BlockRetriever for StoreRetriever {
    fn request(&self, scope: RequestScope, request: BlockRequest) -> RetrievalReceiver {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(&self.inner);

        tokio::spawn(async move {
            if !this.latency.is_zero() {
                tokio::select! {
                    _ = scope.done() => {
                        let _ = tx.send(Err(RetrievalError::Cancelled));
                        return;
                    }
                    _ = tokio::time::sleep(this.latency) => {}
                }
            }
            if scope.is_done() {
                let _ = tx.send(Err(RetrievalError::Cancelled));
                return;
            }

            let pointer = request.pointer;
            let block = match this.lookup(&pointer.id) {
                Some(block) => block,
                None => {
                    debug!(block = %pointer, "block not in store");
                    let _ = tx.send(Err(RetrievalError::NotFound(pointer.id)));
                    return;
                }
            };
            this.block_cache.put(pointer, Arc::clone(&block)).await;
            trace!(block = %pointer, action = %request.action, "retrieved block");

            if request.action.prefetch_tracked() {
                let prefetcher = this.prefetcher.lock().clone();
                if let Some(prefetcher) = prefetcher {
                    let status = this
                        .disk_cache
                        .prefetch_status(&pointer.id)
                        .unwrap_or(PrefetchStatus::NoPrefetch);
                    prefetcher
                        .process_block_for_prefetch(
                            pointer,
                            Arc::clone(&block),
                            request.kmd.clone(),
                            request.priority,
                            request.lifetime,
                            status,
                            request.action,
                        )
                        .await;
                }
            }
            let _ = tx.send(Ok(block));
        });

        rx
    }

    fn put_in_caches<'a>(
        &'a self,
        _scope: &'a RequestScope,
        pointer: BlockPointer,
        volume: VolumeId,
        block: Arc<Block>,
        _lifetime: CacheLifetime,
        status: PrefetchStatus,
        kind: CacheKind,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let size = u64::from(block.encoded_size());
            self.inner.block_cache.put(pointer, block).await;
            self.inner.disk_cache.put(volume, pointer.id, size, status, kind)
        })
    }
}
