//! Collaborator interfaces and in-memory implementations.
//!
//! The engine talks to block storage only through the traits in
//! [`traits`]. The [`memory`] and [`store`] modules provide in-memory
//! implementations for simulations and tests.

pub mod memory;
pub mod store;
pub mod traits;

pub use memory::{LogReporter, MemoryBlockCache, MemoryDiskCache, SystemClock, DEFAULT_MEMORY_CACHE_BYTES};
pub use store::StoreRetriever;
pub use traits::{
    BlockCache, BlockRequest, BlockRetriever, BoxFuture, Clock, DiskBlockCache, Reporter,
    RequestScope, RetrievalReceiver, RetrievalResult, SettingsDb, SpaceCheck,
};
