//! TreePrefetch - background prefetching for block-structured filesystems
//!
//! When a block is read, the engine walks the tree of blocks below it,
//! fetches the children in the background, and tracks per-subtree progress
//! so callers can wait for a whole file or directory to be cached locally.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use treeprefetch::cache::{MemoryBlockCache, MemoryDiskCache, StoreRetriever};
//! use treeprefetch::config::PrefetcherConfig;
//! use treeprefetch::prefetch::{Prefetcher, PrefetcherDeps};
//!
//! let memory = Arc::new(MemoryBlockCache::default());
//! let disk = Arc::new(MemoryDiskCache::unbounded());
//! let store = StoreRetriever::new(memory.clone(), disk.clone());
//! let deps = PrefetcherDeps::new(Arc::new(store.clone()), memory).with_disk_cache(disk);
//! let prefetcher = Prefetcher::start(PrefetcherConfig::default(), deps);
//! store.attach(prefetcher.clone());
//! ```

pub mod action;
pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod prefetch;
pub mod progress;

pub use action::{CacheKind, PrefetchAction, PrefetchStatus};
pub use block::{Block, BlockId, BlockInfo, BlockKind, BlockPointer, KeyMetadata, VolumeId};
pub use config::PrefetcherConfig;
pub use error::{InvariantViolation, PrefetchError};
pub use prefetch::{CompletionSignal, Prefetcher, PrefetcherDeps, Priority};
pub use progress::PrefetchProgress;
