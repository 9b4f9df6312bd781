//! Error types for the prefetch engine.
//!
//! Three kinds of failure exist:
//!
//! - Collaborator failures ([`RetrievalError`], [`CacheError`]) degrade
//!   prefetching and abandon the affected subtree.
//! - Caller-visible failures ([`PrefetchError`]) come from the blocking
//!   public calls: the engine is shut down, or the caller gave up.
//! - [`InvariantViolation`] means the forest bookkeeping is corrupt. The
//!   dispatch loop reports it through a [`FaultHandler`] and stops.

use std::fmt;

use thiserror::Error;

use crate::block::BlockId;

/// Errors returned by a block retrieval.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    /// The request scope was cancelled before the block arrived.
    #[error("retrieval cancelled")]
    Cancelled,

    /// No server or cache holds the block.
    #[error("block {0} not found")]
    NotFound(BlockId),

    /// Any other transport or decoding failure.
    #[error("retrieval failed: {0}")]
    Failed(String),
}

impl RetrievalError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetrievalError::Cancelled)
    }
}

/// Errors returned by the block caches.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The target cache partition has no room left.
    #[error("cache is full")]
    Full,

    /// I/O error from an on-disk cache.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other cache failure.
    #[error("cache error: {0}")]
    Other(String),
}

/// Errors returned by the public [`Prefetcher`](crate::prefetch::Prefetcher) calls.
#[derive(Debug, Error)]
pub enum PrefetchError {
    #[error("prefetcher already shut down")]
    ShutDown,

    /// The caller's cancellation token fired first.
    #[error("operation cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Which bookkeeping rule was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A pending block count would drop below zero.
    PendingUnderflow,
    /// Fetched bytes exceed total bytes.
    FetchedExceedsTotal,
    /// A node reached zero pending blocks with fetched != total.
    ByteMismatchOnCompletion,
    /// A node in the tree was never triggered yet had nothing pending.
    UntriggeredWithoutPending,
    /// A child referenced a parent the forest does not know.
    MissingParent,
    /// A walk reached a node that is no longer in the forest.
    MissingNode,
    /// A walk toward the roots came back to a node on its own path.
    Cycle,
    /// The aggregate sync counter fetched more than its total.
    OverallFetchedExceedsTotal,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ViolationKind::PendingUnderflow => "pending block count underflow",
            ViolationKind::FetchedExceedsTotal => "fetched bytes exceed total",
            ViolationKind::ByteMismatchOnCompletion => "byte mismatch on completion",
            ViolationKind::UntriggeredWithoutPending => "untriggered node without pending blocks",
            ViolationKind::MissingParent => "unknown parent block",
            ViolationKind::MissingNode => "node missing during walk",
            ViolationKind::Cycle => "cycle in prefetch tree",
            ViolationKind::OverallFetchedExceedsTotal => "overall fetched bytes exceed total",
        };
        f.write_str(text)
    }
}

/// A broken forest invariant, with the counters of the node involved.
#[derive(Debug, Clone, Error)]
#[error(
    "invariant violation: {kind} (block={block}, pending={pending}, \
     fetched={bytes_fetched}, total={bytes_total}, parents={parents:?})"
)]
pub struct InvariantViolation {
    pub kind: ViolationKind,
    pub block: BlockId,
    pub pending: u64,
    pub bytes_fetched: u64,
    pub bytes_total: u64,
    /// Parent pointers of the node, rendered for diagnostics.
    pub parents: Vec<String>,
}

impl InvariantViolation {
    /// A violation with no node context.
    pub fn bare(kind: ViolationKind, block: BlockId) -> Self {
        Self {
            kind,
            block,
            pending: 0,
            bytes_fetched: 0,
            bytes_total: 0,
            parents: Vec::new(),
        }
    }
}

// =============================================================================
// Fault Handling
// =============================================================================

/// Receives invariant violations from the dispatch loop.
///
/// The loop has already logged the violation and stops after the handler
/// returns, whatever the handler does.
pub trait FaultHandler: Send + Sync {
    fn on_invariant_violation(&self, violation: &InvariantViolation);
}

/// Aborts the process on the first violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFault;

impl FaultHandler for AbortOnFault {
    fn on_invariant_violation(&self, _violation: &InvariantViolation) {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_message_carries_context() {
        let violation = InvariantViolation {
            kind: ViolationKind::PendingUnderflow,
            block: BlockId::from_bytes([1; 32]),
            pending: 0,
            bytes_fetched: 10,
            bytes_total: 20,
            parents: vec!["01010101".to_string()],
        };
        let message = violation.to_string();
        assert!(message.contains("pending block count underflow"));
        assert!(message.contains("fetched=10"));
        assert!(message.contains("total=20"));
        assert!(message.contains("01010101"));
    }

    #[test]
    fn test_prefetch_error_from_violation() {
        let violation = InvariantViolation::bare(ViolationKind::Cycle, BlockId::ZERO);
        let err: PrefetchError = violation.into();
        assert!(matches!(err, PrefetchError::Invariant(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_retrieval_error_cancelled() {
        assert!(RetrievalError::Cancelled.is_cancelled());
        assert!(!RetrievalError::Failed("boom".into()).is_cancelled());
    }
}
