//! Prefetch actions and statuses.
//!
//! A [`PrefetchAction`] says why a block is being fetched and how far the
//! engine should reach below it. Actions form a small bit set; the named
//! presets cover every combination the engine expects to see.
//!
//! # Example
//!
//! ```ignore
//! use treeprefetch::action::PrefetchAction;
//!
//! let action = PrefetchAction::WITH_PREFETCH.combine(PrefetchAction::SOLO_WITH_SYNC);
//! assert!(action.sync());
//! assert_eq!(action.to_string(), "prefetch|sync");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::Block;

// =============================================================================
// Action Flags
// =============================================================================

const FLAG_TRACKED: u8 = 1 << 0;
const FLAG_PREFETCH: u8 = 1 << 1;
const FLAG_SYNC: u8 = 1 << 2;
const FLAG_STOP_IF_FULL: u8 = 1 << 3;
const FLAG_DEEP_SYNC: u8 = 1 << 4;

/// Policy attached to a block request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrefetchAction(u8);

impl PrefetchAction {
    /// Fetch only this block.
    pub const SOLO: PrefetchAction = PrefetchAction(0);

    /// Fetch only this block, into the sync cache.
    pub const SOLO_WITH_SYNC: PrefetchAction = PrefetchAction(FLAG_SYNC);

    /// The block is the tail of a prefetch and is tracked by its parent.
    pub const PREFETCH_TAIL: PrefetchAction = PrefetchAction(FLAG_TRACKED);

    /// Tracked tail that goes into the sync cache.
    pub const PREFETCH_TAIL_WITH_SYNC: PrefetchAction = PrefetchAction(FLAG_TRACKED | FLAG_SYNC);

    /// Prefetch the immediate children of the block.
    pub const WITH_PREFETCH: PrefetchAction = PrefetchAction(FLAG_TRACKED | FLAG_PREFETCH);

    /// Prefetch the immediate children and sync them.
    pub const WITH_SYNC_AND_PREFETCH: PrefetchAction =
        PrefetchAction(FLAG_TRACKED | FLAG_PREFETCH | FLAG_SYNC);

    /// Prefetch the whole subtree until the cache fills up.
    pub const PREFETCH_UNTIL_FULL: PrefetchAction =
        PrefetchAction(FLAG_TRACKED | FLAG_PREFETCH | FLAG_STOP_IF_FULL);

    /// Sync the whole subtree.
    pub const WITH_DEEP_SYNC: PrefetchAction =
        PrefetchAction(FLAG_TRACKED | FLAG_PREFETCH | FLAG_SYNC | FLAG_DEEP_SYNC);

    /// Raw flag bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Merges two actions, keeping every flag of either side. Stop-if-full
    /// survives only when both sides ask for it.
    pub fn combine(self, other: PrefetchAction) -> PrefetchAction {
        let mut combined = self.0 | other.0;
        if self.stop_if_full() != other.stop_if_full() {
            combined &= !FLAG_STOP_IF_FULL;
        }
        PrefetchAction(combined)
    }

    fn prefetch_bit(&self) -> bool {
        self.0 & FLAG_PREFETCH != 0
    }

    /// Whether fetching `block` with this action should walk its children.
    ///
    /// Syncing part of a multi-block object makes no sense, so a synced
    /// indirect block always prefetches.
    pub fn prefetch(&self, block: &Block) -> bool {
        (block.is_indirect() && self.sync()) || self.prefetch_bit()
    }

    /// Whether the block is tracked by the prefetcher at all.
    pub fn prefetch_tracked(&self) -> bool {
        self.prefetch_bit() || self.0 & FLAG_TRACKED != 0
    }

    pub fn sync(&self) -> bool {
        self.0 & FLAG_SYNC != 0
    }

    pub fn deep_sync(&self) -> bool {
        *self == Self::WITH_DEEP_SYNC
    }

    /// Whether prefetching continues all the way to the leaves.
    pub fn deep_prefetch(&self) -> bool {
        self.deep_sync() || *self == Self::PREFETCH_UNTIL_FULL
    }

    pub fn stop_if_full(&self) -> bool {
        self.0 & FLAG_STOP_IF_FULL != 0
    }

    /// The action handed down to the children of `block`.
    pub fn child_action(self, block: &Block) -> PrefetchAction {
        if self.deep_prefetch() || (block.is_indirect() && self.sync()) {
            return self;
        }
        PrefetchAction(self.0 & !(FLAG_PREFETCH | FLAG_SYNC))
    }

    /// A single-block action that keeps only the sync flag.
    pub fn solo_action(self) -> PrefetchAction {
        PrefetchAction(self.0 & FLAG_SYNC)
    }

    /// Adds syncing. A prefetching action becomes a deep sync; a solo
    /// action only gains the sync flag.
    pub fn add_sync(self) -> PrefetchAction {
        if self.prefetch_bit() {
            return Self::WITH_DEEP_SYNC;
        }
        PrefetchAction(self.0 | FLAG_SYNC)
    }

    /// Which disk cache partition the block belongs in.
    pub fn cache_kind(&self) -> CacheKind {
        if self.sync() {
            CacheKind::Sync
        } else {
            CacheKind::Any
        }
    }

    /// Parses the short names used on the command line and in logs.
    pub fn from_name(name: &str) -> Option<PrefetchAction> {
        match name {
            "solo" => Some(Self::SOLO),
            "solo-sync" => Some(Self::SOLO_WITH_SYNC),
            "prefetch" => Some(Self::WITH_PREFETCH),
            "prefetch-sync" => Some(Self::WITH_SYNC_AND_PREFETCH),
            "until-full" => Some(Self::PREFETCH_UNTIL_FULL),
            "deep-sync" => Some(Self::WITH_DEEP_SYNC),
            _ => None,
        }
    }
}

impl fmt::Display for PrefetchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deep_sync() {
            return f.write_str("deep-sync");
        }
        if *self == Self::SOLO {
            return f.write_str("solo");
        }

        let mut attrs = Vec::with_capacity(3);
        if self.prefetch_bit() {
            attrs.push("prefetch");
        } else if self.prefetch_tracked() {
            attrs.push("prefetch-tracked");
        }
        if self.sync() {
            attrs.push("sync");
        }
        if self.stop_if_full() {
            attrs.push("stop-if-full");
        }
        f.write_str(&attrs.join("|"))
    }
}

impl fmt::Debug for PrefetchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrefetchAction({})", self)
    }
}

// =============================================================================
// Prefetch Status
// =============================================================================

/// Prefetch state of one block instance, as recorded in the caches.
///
/// Statuses only move forward: `NoPrefetch -> Triggered -> Finished`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrefetchStatus {
    #[default]
    NoPrefetch,
    Triggered,
    Finished,
}

impl PrefetchStatus {
    /// Returns the later of the two statuses.
    pub fn advance(self, other: PrefetchStatus) -> PrefetchStatus {
        self.max(other)
    }
}

impl fmt::Display for PrefetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefetchStatus::NoPrefetch => f.write_str("no-prefetch"),
            PrefetchStatus::Triggered => f.write_str("triggered"),
            PrefetchStatus::Finished => f.write_str("finished"),
        }
    }
}

/// Partition of the disk block cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    /// Whichever partition already holds the block.
    Any,
    /// Best-effort working set, evictable.
    WorkingSet,
    /// Durable, space-accounted sync partition.
    Sync,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKind::Any => f.write_str("any"),
            CacheKind::WorkingSet => f.write_str("working-set"),
            CacheKind::Sync => f.write_str("sync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, BlockInfo, BlockPointer, DirBlock, FileBlock};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn indirect_file() -> Block {
        let ptr = BlockPointer::new(BlockId::for_content(b"child"));
        Block::File(FileBlock::indirect(vec![BlockInfo::new(ptr, 10)], 20))
    }

    fn direct_dir() -> Block {
        Block::Dir(DirBlock::direct(BTreeMap::new(), 5))
    }

    #[test]
    fn test_combine_keeps_union() {
        let combined = PrefetchAction::WITH_PREFETCH.combine(PrefetchAction::SOLO_WITH_SYNC);
        assert_eq!(combined, PrefetchAction::WITH_SYNC_AND_PREFETCH);
    }

    #[test]
    fn test_combine_drops_disputed_stop_if_full() {
        let combined = PrefetchAction::PREFETCH_UNTIL_FULL.combine(PrefetchAction::WITH_PREFETCH);
        assert!(!combined.stop_if_full());
        assert_eq!(combined, PrefetchAction::WITH_PREFETCH);

        let agreed = PrefetchAction::PREFETCH_UNTIL_FULL.combine(PrefetchAction::PREFETCH_UNTIL_FULL);
        assert!(agreed.stop_if_full());
    }

    #[test]
    fn test_combine_never_relaxes_sync() {
        let synced = PrefetchAction::WITH_DEEP_SYNC;
        for other in [
            PrefetchAction::SOLO,
            PrefetchAction::PREFETCH_TAIL,
            PrefetchAction::WITH_PREFETCH,
            PrefetchAction::PREFETCH_UNTIL_FULL,
        ] {
            assert!(synced.combine(other).sync());
            assert!(other.combine(synced).sync());
        }
    }

    #[test]
    fn test_synced_indirect_block_always_prefetches() {
        let block = indirect_file();
        assert!(PrefetchAction::SOLO_WITH_SYNC.prefetch(&block));
        assert!(!PrefetchAction::SOLO.prefetch(&block));
        assert!(!PrefetchAction::SOLO_WITH_SYNC.prefetch(&direct_dir()));
        assert!(PrefetchAction::WITH_PREFETCH.prefetch(&direct_dir()));
    }

    #[test]
    fn test_child_action() {
        let dir = direct_dir();
        assert_eq!(
            PrefetchAction::WITH_PREFETCH.child_action(&dir),
            PrefetchAction::PREFETCH_TAIL
        );
        assert_eq!(
            PrefetchAction::WITH_SYNC_AND_PREFETCH.child_action(&dir),
            PrefetchAction::PREFETCH_TAIL
        );
        assert_eq!(
            PrefetchAction::WITH_DEEP_SYNC.child_action(&dir),
            PrefetchAction::WITH_DEEP_SYNC
        );
        assert_eq!(
            PrefetchAction::WITH_SYNC_AND_PREFETCH.child_action(&indirect_file()),
            PrefetchAction::WITH_SYNC_AND_PREFETCH
        );
    }

    #[test]
    fn test_deep_predicates() {
        assert!(PrefetchAction::WITH_DEEP_SYNC.deep_sync());
        assert!(PrefetchAction::WITH_DEEP_SYNC.deep_prefetch());
        assert!(PrefetchAction::PREFETCH_UNTIL_FULL.deep_prefetch());
        assert!(!PrefetchAction::PREFETCH_UNTIL_FULL.deep_sync());
        assert!(!PrefetchAction::WITH_SYNC_AND_PREFETCH.deep_prefetch());
    }

    #[test]
    fn test_solo_and_add_sync() {
        assert_eq!(
            PrefetchAction::WITH_DEEP_SYNC.solo_action(),
            PrefetchAction::SOLO_WITH_SYNC
        );
        assert_eq!(PrefetchAction::WITH_PREFETCH.solo_action(), PrefetchAction::SOLO);
        assert_eq!(
            PrefetchAction::WITH_PREFETCH.add_sync(),
            PrefetchAction::WITH_DEEP_SYNC
        );
        assert_eq!(PrefetchAction::SOLO.add_sync(), PrefetchAction::SOLO_WITH_SYNC);
    }

    #[test]
    fn test_cache_kind() {
        assert_eq!(PrefetchAction::SOLO_WITH_SYNC.cache_kind(), CacheKind::Sync);
        assert_eq!(PrefetchAction::WITH_PREFETCH.cache_kind(), CacheKind::Any);
    }

    #[test]
    fn test_display() {
        assert_eq!(PrefetchAction::WITH_DEEP_SYNC.to_string(), "deep-sync");
        assert_eq!(PrefetchAction::SOLO.to_string(), "solo");
        assert_eq!(PrefetchAction::PREFETCH_TAIL.to_string(), "prefetch-tracked");
        assert_eq!(
            PrefetchAction::PREFETCH_UNTIL_FULL.to_string(),
            "prefetch|stop-if-full"
        );
        assert_eq!(
            PrefetchAction::WITH_SYNC_AND_PREFETCH.to_string(),
            "prefetch|sync"
        );
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            PrefetchAction::from_name("deep-sync"),
            Some(PrefetchAction::WITH_DEEP_SYNC)
        );
        assert_eq!(
            PrefetchAction::from_name("until-full"),
            Some(PrefetchAction::PREFETCH_UNTIL_FULL)
        );
        assert_eq!(PrefetchAction::from_name("bogus"), None);
    }

    #[test]
    fn test_status_only_advances() {
        assert_eq!(
            PrefetchStatus::Finished.advance(PrefetchStatus::Triggered),
            PrefetchStatus::Finished
        );
        assert_eq!(
            PrefetchStatus::NoPrefetch.advance(PrefetchStatus::Triggered),
            PrefetchStatus::Triggered
        );
    }

    #[test]
    fn test_direct_file_prefetch_follows_prefetch_bit() {
        let block = Block::File(FileBlock::direct(Bytes::from_static(b"x"), 1));
        assert!(PrefetchAction::WITH_SYNC_AND_PREFETCH.prefetch(&block));
        assert!(!PrefetchAction::PREFETCH_TAIL_WITH_SYNC.prefetch(&block));
    }
}
