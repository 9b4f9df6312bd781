//! Per-block bookkeeping records of the prefetch forest.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::block::{BlockPointer, RefNonce};
use crate::cache::RequestScope;
use crate::error::{InvariantViolation, ViolationKind};
use crate::prefetch::request::PrefetchRequest;
use crate::progress::PrefetchProgress;

// =============================================================================
// Completion Signal
// =============================================================================

/// One-shot signal closed when a prefetch subtree finishes or is cancelled.
///
/// Clones observe the same signal. Closing is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CompletionSignal {
    token: CancellationToken,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A signal that is already closed.
    pub fn closed() -> Self {
        let signal = Self::new();
        signal.close();
        signal
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is closed.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

// =============================================================================
// Prefetch Node
// =============================================================================

/// Parent edges for one reference nonce, keyed by parent pointer. Each edge
/// keeps the signal of the parent instance that counted this node.
pub(crate) type ParentEdges = HashMap<BlockPointer, CompletionSignal>;

/// Bookkeeping for one block identifier in the forest.
#[derive(Debug)]
pub(crate) struct PrefetchNode {
    /// Blocks of this subtree not yet finished.
    pub pending: u64,
    pub progress: PrefetchProgress,
    /// Children have been walked for this node.
    pub triggered: bool,
    /// Children must be walked again because the action escalated.
    pub retrigger: bool,
    pub request: PrefetchRequest,
    pub parents: HashMap<RefNonce, ParentEdges>,
    pub scope: RequestScope,
    pub wait: CompletionSignal,
}

impl PrefetchNode {
    pub fn new(
        pending: u64,
        progress: PrefetchProgress,
        triggered: bool,
        request: PrefetchRequest,
        scope: RequestScope,
    ) -> Self {
        Self {
            pending,
            progress,
            triggered,
            retrigger: false,
            request,
            parents: HashMap::new(),
            scope,
            wait: CompletionSignal::new(),
        }
    }

    /// Closes the wait signal and cancels every retrieval under the scope.
    pub fn close(&self) {
        self.wait.close();
        self.scope.token().cancel();
    }

    pub fn has_parents(&self) -> bool {
        !self.parents.is_empty()
    }

    pub fn has_edge(&self, ref_nonce: RefNonce, parent: &BlockPointer) -> bool {
        self.parents
            .get(&ref_nonce)
            .is_some_and(|edges| edges.contains_key(parent))
    }

    /// Records a parent edge, replacing the parent signal if the edge exists.
    pub fn add_edge(&mut self, ref_nonce: RefNonce, parent: BlockPointer, signal: CompletionSignal) {
        self.parents.entry(ref_nonce).or_default().insert(parent, signal);
    }

    /// Drops an edge, and the nonce's edge set once it is empty.
    pub fn remove_edge(&mut self, ref_nonce: RefNonce, parent: &BlockPointer) {
        if let Some(edges) = self.parents.get_mut(&ref_nonce) {
            edges.remove(parent);
            if edges.is_empty() {
                self.parents.remove(&ref_nonce);
            }
        }
    }

    /// Drops an edge whose parent instance has already closed.
    pub fn drop_closed_edge(&mut self, ref_nonce: RefNonce, parent: &BlockPointer) {
        if let Some(edges) = self.parents.get_mut(&ref_nonce) {
            if edges.get(parent).is_some_and(CompletionSignal::is_closed) {
                edges.remove(parent);
            }
            if edges.is_empty() {
                self.parents.remove(&ref_nonce);
            }
        }
    }

    pub fn decrement(&mut self, blocks: u64) -> Result<(), InvariantViolation> {
        self.pending = self
            .pending
            .checked_sub(blocks)
            .ok_or_else(|| self.violation(ViolationKind::PendingUnderflow))?;
        Ok(())
    }

    pub fn add_fetched(&mut self, bytes: u64) -> Result<(), InvariantViolation> {
        self.progress.bytes_fetched += bytes;
        if self.progress.bytes_fetched > self.progress.bytes_total {
            return Err(self.violation(ViolationKind::FetchedExceedsTotal));
        }
        Ok(())
    }

    pub fn add_subtree(&mut self, blocks: u64, fetched: u64, total: u64) {
        self.pending += blocks;
        self.progress.bytes_fetched += fetched;
        self.progress.bytes_total += total;
    }

    /// A violation carrying this node's counters.
    pub fn violation(&self, kind: ViolationKind) -> InvariantViolation {
        InvariantViolation {
            kind,
            block: self.request.pointer.id,
            pending: self.pending,
            bytes_fetched: self.progress.bytes_fetched,
            bytes_total: self.progress.bytes_total,
            parents: self.describe_parents(),
        }
    }

    fn describe_parents(&self) -> Vec<String> {
        let mut parents: Vec<String> = self
            .parents
            .iter()
            .flat_map(|(nonce, edges)| {
                edges.iter().map(move |(parent, signal)| {
                    format!(
                        "{}->{}{}",
                        nonce,
                        parent,
                        if signal.is_closed() { " (closed)" } else { "" }
                    )
                })
            })
            .collect();
        parents.sort();
        parents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::prefetch::request::tests::sample_request;
    use std::time::Duration;
    use tokio::time::Instant;

    fn node(pending: u64, total: u64) -> PrefetchNode {
        let scope = RequestScope::new(
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(60),
        );
        let progress = PrefetchProgress {
            bytes_fetched: 0,
            bytes_total: total,
            start: None,
        };
        PrefetchNode::new(pending, progress, false, sample_request(b"node", 10), scope)
    }

    fn parent(seed: &[u8]) -> BlockPointer {
        BlockPointer::new(BlockId::for_content(seed))
    }

    #[tokio::test]
    async fn test_completion_signal_closes_once() {
        let signal = CompletionSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_closed());
        signal.close();
        signal.close();
        assert!(observer.is_closed());
        observer.wait().await;
        assert!(CompletionSignal::closed().is_closed());
    }

    #[test]
    fn test_close_cancels_scope() {
        let node = node(1, 10);
        let token = node.scope.token().clone();
        node.close();
        assert!(node.wait.is_closed());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_decrement_underflow_is_violation() {
        let mut node = node(1, 10);
        node.decrement(1).unwrap();
        let err = node.decrement(1).unwrap_err();
        assert_eq!(err.kind, ViolationKind::PendingUnderflow);
        assert_eq!(err.pending, 0);
    }

    #[test]
    fn test_add_fetched_beyond_total_is_violation() {
        let mut node = node(1, 10);
        node.add_fetched(10).unwrap();
        let err = node.add_fetched(1).unwrap_err();
        assert_eq!(err.kind, ViolationKind::FetchedExceedsTotal);
        assert_eq!(err.bytes_fetched, 11);
    }

    #[test]
    fn test_edges_and_closed_edge_pruning() {
        let mut node = node(1, 10);
        let a = parent(b"a");
        let b = parent(b"b");
        let closed = CompletionSignal::closed();
        node.add_edge(RefNonce::ZERO, a, CompletionSignal::new());
        node.add_edge(RefNonce(1), b, closed);
        assert!(node.has_edge(RefNonce::ZERO, &a));
        assert!(!node.has_edge(RefNonce::ZERO, &b));

        node.drop_closed_edge(RefNonce::ZERO, &a);
        assert!(node.has_edge(RefNonce::ZERO, &a));

        node.drop_closed_edge(RefNonce(1), &b);
        assert!(!node.parents.contains_key(&RefNonce(1)));
        assert!(node.has_parents());

        let described = node.violation(ViolationKind::MissingNode).parents;
        assert_eq!(described.len(), 1);
    }
}
