//! Tree prefetch engine.
//!
//! When a block is fetched with a prefetching action, the engine walks its
//! children, requests them from the retriever, and follows each retrieved
//! child down the tree. Every triggered block keeps a node in a forest that
//! counts the blocks still pending below it; when the count reaches zero
//! the block is marked finished in the disk cache and waiters are released.
//!
//! # Architecture
//!
//! ```text
//! Prefetcher (handle) ──events──► Dispatcher (single task)
//!                                    │  owns the Forest
//!                                    ├─► BlockRetriever::request(child)
//!                                    │        │
//!                                    │        ▼
//!                                    │   in-flight tracker ──failure──► cancel event
//!                                    │
//!  retriever ──process_block_for_prefetch──► trigger event
//! ```
//!
//! All forest mutation happens on the dispatch task. Public calls only send
//! events and wait on reply channels.

mod backpressure;
mod dispatch;
mod engine;
mod node;
mod overall;
mod policy;
mod queued;
mod request;
mod tree;

pub use engine::{Prefetcher, PrefetcherDeps};
pub use node::CompletionSignal;
pub use policy::{
    calculate_priority, ExponentialBackoff, Priority, PRIORITY_ON_DEMAND, PRIORITY_THROTTLE,
    PRIORITY_UPDATE_POINTER,
};
