//! The prefetch forest.
//!
//! Every in-progress prefetch lives in one arena keyed by block identifier.
//! A node records its parents as `(reference nonce, parent pointer)` edges,
//! each edge holding the completion signal of the parent instance that
//! counted the node. Walks toward the roots look parents up by identifier,
//! so a parent that was removed (or removed and re-created) is seen as a
//! missing or closed edge and pruned instead of being mutated.
//!
//! Walks first collect the lineage (ancestors before the node itself), then
//! apply their mutation in that order. The lineage holds one entry per path:
//! an ancestor reachable over two paths, such as a directory holding two
//! copies of the same file, appears once for each. Additions and
//! subtractions follow the same paths, so its counts stay balanced. Meeting
//! a node again on its own path is a cycle and reported as an invariant
//! violation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::action::{PrefetchAction, PrefetchStatus};
use crate::block::{
    Block, BlockId, BlockInfo, BlockKind, BlockPointer, CacheLifetime, DirBlock, EntryType,
    KeyMetadata, RefNonce, VolumeId,
};
use crate::cache::{BlockRetriever, Clock, RequestScope};
use crate::config::{BackoffConfig, PrefetcherConfig, MAX_NODE_TIMEOUT};
use crate::error::{InvariantViolation, ViolationKind};
use crate::prefetch::node::{CompletionSignal, PrefetchNode};
use crate::prefetch::overall::OverallProgress;
use crate::prefetch::policy::{calculate_priority, ExponentialBackoff, Priority};
use crate::prefetch::request::{EventSender, InFlight, PrefetchRequest, StatusQuery};
use crate::progress::PrefetchProgress;

/// Block count and byte totals of a subtree, added to every ancestor when
/// the subtree joins the forest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SubtreeCounts {
    pub blocks: u64,
    pub fetched: u64,
    pub total: u64,
}

impl std::ops::AddAssign for SubtreeCounts {
    fn add_assign(&mut self, other: Self) {
        self.blocks += other.blocks;
        self.fetched += other.fetched;
        self.total += other.total;
    }
}

/// Result of walking a fetched block's children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalkOutcome {
    /// The block has nothing below it to prefetch.
    Tail,
    Children(SubtreeCounts),
    /// The block's kind cannot be walked.
    UnknownKind,
}

/// Backoff state of a top block removed from the forest for lack of space.
struct RescheduleEntry {
    backoff: ExponentialBackoff,
    timer: Option<AbortHandle>,
    volume: VolumeId,
}

/// What every child requested during one walk inherits from its parent.
struct ChildTemplate {
    kmd: KeyMetadata,
    lifetime: CacheLifetime,
    priority: Priority,
    action: PrefetchAction,
}

pub(crate) struct Forest {
    nodes: HashMap<BlockId, PrefetchNode>,
    rescheduled: HashMap<BlockId, RescheduleEntry>,
    retriever: Arc<dyn BlockRetriever>,
    overall: Arc<OverallProgress>,
    events: EventSender,
    in_flight: mpsc::UnboundedSender<InFlight>,
    root: CancellationToken,
    clock: Arc<dyn Clock>,
    node_timeout: Duration,
    backoff: BackoffConfig,
}

impl Forest {
    pub fn new(
        retriever: Arc<dyn BlockRetriever>,
        overall: Arc<OverallProgress>,
        events: EventSender,
        in_flight: mpsc::UnboundedSender<InFlight>,
        root: CancellationToken,
        clock: Arc<dyn Clock>,
        config: &PrefetcherConfig,
    ) -> Self {
        Self {
            nodes: HashMap::new(),
            rescheduled: HashMap::new(),
            retriever,
            overall,
            events,
            in_flight,
            root,
            clock,
            node_timeout: config.node_timeout,
            backoff: config.backoff.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &BlockId) -> Option<&PrefetchNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &BlockId) -> Option<&mut PrefetchNode> {
        self.nodes.get_mut(id)
    }

    /// Whether a backoff timer is pending for the block.
    pub fn is_rescheduled(&self, id: &BlockId) -> bool {
        self.rescheduled
            .get(id)
            .is_some_and(|entry| entry.timer.is_some())
    }

    pub fn status(&self, pointer: &BlockPointer) -> PrefetchProgress {
        self.nodes
            .get(&pointer.id)
            .map(|node| node.progress)
            .unwrap_or_default()
    }

    /// The node's wait signal, or a closed one for an unknown block.
    pub fn wait_signal(&self, pointer: &BlockPointer) -> CompletionSignal {
        self.nodes
            .get(&pointer.id)
            .map(|node| node.wait.clone())
            .unwrap_or_else(CompletionSignal::closed)
    }

    pub fn answer_status(&self, query: StatusQuery) {
        let _ = query.reply.send(self.status(&query.pointer));
    }

    /// Answers every status query already waiting.
    pub fn drain_statuses(&self, statuses: &mut mpsc::UnboundedReceiver<StatusQuery>) {
        while let Ok(query) = statuses.try_recv() {
            self.answer_status(query);
        }
    }

    /// A retrieval scope for the block: the node's own, or a fresh child of
    /// the root scope when the block has no node.
    pub fn scope_for(&self, id: &BlockId) -> RequestScope {
        match self.nodes.get(id) {
            Some(node) => node.scope.clone(),
            None => self.new_scope(),
        }
    }

    fn new_scope(&self) -> RequestScope {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.node_timeout)
            .unwrap_or_else(|| now + MAX_NODE_TIMEOUT);
        RequestScope::new(self.root.child_token(), deadline)
    }

    fn new_node(
        &self,
        pending: u64,
        total: u64,
        triggered: bool,
        request: PrefetchRequest,
    ) -> PrefetchNode {
        let progress = PrefetchProgress::new(total, self.clock.now());
        PrefetchNode::new(pending, progress, triggered, request, self.new_scope())
    }

    /// Adds the root of a new prefetch tree. Its own block is already
    /// fetched, so it starts with nothing pending.
    pub fn insert_root(&mut self, request: PrefetchRequest) {
        let id = request.pointer.id;
        let node = self.new_node(0, 0, true, request);
        self.nodes.insert(id, node);
    }

    /// Removes a node without completing it.
    pub fn remove(&mut self, id: &BlockId) {
        if let Some(node) = self.nodes.remove(id) {
            self.forget_reschedule(id);
            self.discard(node);
        }
    }

    fn discard(&self, mut node: PrefetchNode) {
        node.close();
        self.overall.remove_total(&mut node.request);
    }

    // =========================================================================
    // Lineage
    // =========================================================================

    /// The node and all its live ancestors over every reference nonce,
    /// ancestors first, once per path.
    fn lineage(&mut self, id: BlockId) -> Result<Vec<BlockId>, InvariantViolation> {
        let mut lineage = Vec::new();
        let mut path = HashSet::new();
        self.collect_lineage(id, &mut lineage, &mut path)?;
        Ok(lineage)
    }

    fn collect_lineage(
        &mut self,
        id: BlockId,
        lineage: &mut Vec<BlockId>,
        path: &mut HashSet<BlockId>,
    ) -> Result<(), InvariantViolation> {
        if !path.insert(id) {
            return Err(self.cycle(id));
        }
        let edges: Vec<(RefNonce, BlockPointer, bool)> = match self.nodes.get(&id) {
            Some(node) => node
                .parents
                .iter()
                .flat_map(|(nonce, edges)| {
                    edges
                        .iter()
                        .map(move |(parent, signal)| (*nonce, *parent, signal.is_closed()))
                })
                .collect(),
            None => return Err(InvariantViolation::bare(ViolationKind::MissingNode, id)),
        };

        for (nonce, parent, closed) in edges {
            if !closed && self.nodes.contains_key(&parent.id) {
                self.collect_lineage(parent.id, lineage, path)?;
            } else if let Some(node) = self.nodes.get_mut(&id) {
                trace!(block = %id, parent = %parent, "Pruning stale parent edge");
                node.remove_edge(nonce, &parent);
            }
        }
        path.remove(&id);
        lineage.push(id);
        Ok(())
    }

    /// The pointer and its live ancestors through the pointer's reference
    /// nonce only, ancestors first, once per path.
    fn ptr_lineage(&mut self, pointer: BlockPointer) -> Result<Vec<BlockPointer>, InvariantViolation> {
        let mut lineage = Vec::new();
        let mut path = HashSet::new();
        self.collect_ptr_lineage(pointer, &mut lineage, &mut path)?;
        Ok(lineage)
    }

    fn collect_ptr_lineage(
        &mut self,
        pointer: BlockPointer,
        lineage: &mut Vec<BlockPointer>,
        path: &mut HashSet<BlockId>,
    ) -> Result<(), InvariantViolation> {
        if !path.insert(pointer.id) {
            return Err(self.cycle(pointer.id));
        }
        let edges: Vec<(BlockPointer, bool)> = match self.nodes.get(&pointer.id) {
            Some(node) => node
                .parents
                .get(&pointer.ref_nonce)
                .map(|edges| {
                    edges
                        .iter()
                        .map(|(parent, signal)| (*parent, signal.is_closed()))
                        .collect()
                })
                .unwrap_or_default(),
            None => return Err(InvariantViolation::bare(ViolationKind::MissingNode, pointer.id)),
        };

        for (parent, closed) in edges {
            if !closed && self.nodes.contains_key(&parent.id) {
                self.collect_ptr_lineage(parent, lineage, path)?;
            } else if let Some(node) = self.nodes.get_mut(&pointer.id) {
                node.remove_edge(pointer.ref_nonce, &parent);
            }
        }
        path.remove(&pointer.id);
        lineage.push(pointer);
        Ok(())
    }

    fn cycle(&self, id: BlockId) -> InvariantViolation {
        match self.nodes.get(&id) {
            Some(node) => node.violation(ViolationKind::Cycle),
            None => InvariantViolation::bare(ViolationKind::Cycle, id),
        }
    }

    fn lineage_node(&mut self, id: &BlockId) -> Result<&mut PrefetchNode, InvariantViolation> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| InvariantViolation::bare(ViolationKind::MissingNode, *id))
    }

    // =========================================================================
    // Walks
    // =========================================================================

    /// Subtracts `blocks` finished blocks and adds `bytes` fetched bytes at
    /// the node and every ancestor. Nodes reaching zero pending blocks are
    /// removed and returned, ancestors first; the caller marks them finished
    /// and closes them.
    pub fn complete(
        &mut self,
        id: BlockId,
        blocks: u64,
        bytes: u64,
    ) -> Result<Vec<PrefetchNode>, InvariantViolation> {
        let mut finished = Vec::new();
        let mut removed = HashSet::new();
        for id in self.lineage(id)? {
            // Already finished over an earlier path of this walk.
            if removed.contains(&id) {
                continue;
            }
            let node = self.lineage_node(&id)?;
            node.decrement(blocks)?;
            node.progress.bytes_fetched += bytes;
            if node.pending > 0 {
                continue;
            }
            if !node.progress.is_complete() {
                return Err(node.violation(ViolationKind::ByteMismatchOnCompletion));
            }
            if let Some(node) = self.nodes.remove(&id) {
                self.forget_reschedule(&id);
                removed.insert(id);
                finished.push(node);
            }
        }
        Ok(finished)
    }

    /// Adds a subtree's counts to the node and every ancestor.
    pub fn add_subtree(&mut self, id: BlockId, counts: SubtreeCounts) -> Result<(), InvariantViolation> {
        for id in self.lineage(id)? {
            self.lineage_node(&id)?
                .add_subtree(counts.blocks, counts.fetched, counts.total);
        }
        Ok(())
    }

    /// Counts the node's own block as no longer pending, at the node and
    /// every ancestor.
    pub fn decrement(&mut self, id: BlockId) -> Result<(), InvariantViolation> {
        for id in self.lineage(id)? {
            self.lineage_node(&id)?.decrement(1)?;
        }
        Ok(())
    }

    pub fn add_fetched(&mut self, id: BlockId, bytes: u64) -> Result<(), InvariantViolation> {
        for id in self.lineage(id)? {
            self.lineage_node(&id)?.add_fetched(bytes)?;
        }
        Ok(())
    }

    /// Cancels the pointer and its ancestors through the pointer's
    /// reference nonce. Each loses only that nonce's edges and is discarded
    /// once it has no parents left. Returns the number of discarded nodes.
    pub fn cancel(&mut self, pointer: BlockPointer) -> Result<usize, InvariantViolation> {
        if !self.nodes.contains_key(&pointer.id) {
            debug!(block = %pointer, "Nothing to cancel");
            return Ok(0);
        }
        debug!(block = %pointer, "Cancelling prefetch");
        let mut discarded = 0;
        for pointer in self.ptr_lineage(pointer)? {
            if self.cancel_edge(pointer) {
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    fn cancel_edge(&mut self, pointer: BlockPointer) -> bool {
        let Some(node) = self.nodes.get_mut(&pointer.id) else {
            return false;
        };
        node.parents.remove(&pointer.ref_nonce);
        if node.has_parents() {
            return false;
        }
        self.remove(&pointer.id);
        true
    }

    /// Removes every node and pending reschedule of the volume. Returns the
    /// number of removed nodes.
    pub fn cancel_volume(&mut self, volume: VolumeId) -> usize {
        let ids: Vec<BlockId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.request.volume() == volume)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove(id);
        }

        let rescheduled: Vec<BlockId> = self
            .rescheduled
            .iter()
            .filter(|(_, entry)| entry.volume == volume)
            .map(|(id, _)| *id)
            .collect();
        for id in &rescheduled {
            self.forget_reschedule(id);
        }
        debug!(
            volume = %volume,
            nodes = ids.len(),
            reschedules = rescheduled.len(),
            "Cancelled volume prefetches"
        );
        ids.len()
    }

    // =========================================================================
    // Rescheduling
    // =========================================================================

    /// Moves the request's top-most ancestor out of the forest and arms its
    /// backoff timer. Intermediate ancestors and the block itself lose their
    /// edges and are discarded.
    pub fn reschedule(&mut self, request: PrefetchRequest) -> Result<(), InvariantViolation> {
        let id = request.pointer.id;
        match self.nodes.get_mut(&id) {
            Some(node) => {
                let counted = node.request.counted_in_overall;
                node.request = request;
                node.request.counted_in_overall = counted;
            }
            None => {
                let total = u64::from(request.encoded_size);
                let node = self.new_node(1, total, false, request);
                self.nodes.insert(id, node);
            }
        }
        debug!(block = %id, "Rescheduling top-block prefetch");
        for id in self.lineage(id)? {
            self.reschedule_top_block(id);
        }
        Ok(())
    }

    fn reschedule_top_block(&mut self, id: BlockId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.has_parents() {
            let nonces: Vec<RefNonce> = node.parents.keys().copied().collect();
            for nonce in nonces {
                self.cancel_edge(BlockPointer::new(id).with_ref_nonce(nonce));
            }
            return;
        }

        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        let volume = node.request.volume();
        let mut request = node.request.clone();
        request.obsoleted = None;
        request.counted_in_overall = false;
        self.discard(node);

        let backoff = self.backoff.clone();
        let entry = self.rescheduled.entry(id).or_insert_with(|| RescheduleEntry {
            backoff: ExponentialBackoff::new(backoff),
            timer: None,
            volume,
        });
        if entry.timer.is_some() {
            return;
        }
        let Some(delay) = entry.backoff.next_backoff() else {
            debug!(block = %id, "Stopping rescheduling, backoff exhausted");
            self.rescheduled.remove(&id);
            return;
        };
        debug!(block = %id, delay_ms = delay.as_millis() as u64, "Rescheduling prefetch");
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.trigger(request);
        });
        entry.timer = Some(timer.abort_handle());
    }

    /// Stops the block's backoff timer, keeping its backoff state.
    pub fn clear_reschedule_state(&mut self, id: &BlockId) {
        if let Some(timer) = self.rescheduled.get_mut(id).and_then(|e| e.timer.take()) {
            timer.abort();
        }
    }

    pub fn clear_all_reschedules(&mut self) {
        for entry in self.rescheduled.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }

    /// Stops the block's backoff timer and drops its backoff state.
    pub fn forget_reschedule(&mut self, id: &BlockId) {
        self.clear_reschedule_state(id);
        self.rescheduled.remove(id);
    }

    /// Closes every remaining node. Used when the dispatch loop exits.
    pub fn close_all(&mut self) {
        self.clear_all_reschedules();
        for (_, node) in self.nodes.drain() {
            node.close();
        }
    }

    // =========================================================================
    // Triggering
    // =========================================================================

    /// Requests the children of a fetched block and links them to its node.
    ///
    /// `is_new` is set when the node was created for this walk, which makes
    /// every child count toward it even when an edge already exists. Status
    /// queries are answered between children.
    pub fn handle_prefetch(
        &mut self,
        id: BlockId,
        is_new: bool,
        action: PrefetchAction,
        block: &Block,
        statuses: &mut mpsc::UnboundedReceiver<StatusQuery>,
    ) -> Result<WalkOutcome, InvariantViolation> {
        let request = &self.lineage_node(&id)?.request;
        let parent = request.pointer;
        let child_action = action.child_action(block);
        let template = ChildTemplate {
            kmd: request.kmd.clone(),
            lifetime: request.lifetime,
            priority: calculate_priority(request.priority, child_action),
            action: child_action,
        };

        let children = match block {
            Block::File(file) if file.is_indirect => file
                .indirect_ptrs
                .iter()
                .map(|info| (*info, BlockKind::File))
                .collect(),
            Block::File(_) => return Ok(WalkOutcome::Tail),
            Block::Dir(dir) if dir.is_indirect => dir
                .indirect_ptrs
                .iter()
                .map(|info| (*info, BlockKind::Dir))
                .collect(),
            Block::Dir(dir) => direct_dir_children(dir),
            Block::Unknown { .. } => return Ok(WalkOutcome::UnknownKind),
        };
        if children.is_empty() {
            return Ok(WalkOutcome::Tail);
        }

        let mut counts = SubtreeCounts::default();
        let mut seen = HashSet::with_capacity(children.len());
        for (info, kind) in children {
            counts += self.request_child(parent, is_new, info, kind, &template, &mut seen)?;
            self.drain_statuses(statuses);
        }
        Ok(WalkOutcome::Children(counts))
    }

    /// Links one child to its parent, creating and requesting the child
    /// when it is not in the forest yet. Returns what the new edge adds to
    /// the parent, or nothing when the edge was already counted.
    fn request_child(
        &mut self,
        parent: BlockPointer,
        parent_is_new: bool,
        info: BlockInfo,
        kind: BlockKind,
        template: &ChildTemplate,
        seen: &mut HashSet<BlockId>,
    ) -> Result<SubtreeCounts, InvariantViolation> {
        let pointer = info.pointer;
        if !seen.insert(pointer.id) {
            return Ok(SubtreeCounts::default());
        }
        let parent_wait = match self.nodes.get(&parent.id) {
            Some(node) => node.wait.clone(),
            None => {
                debug!(parent = %parent, block = %pointer, "Parent of child block is not in the forest");
                return Err(InvariantViolation::bare(ViolationKind::MissingParent, pointer.id));
            }
        };

        let is_new = !self.nodes.contains_key(&pointer.id);
        if is_new {
            let request = PrefetchRequest {
                pointer,
                encoded_size: info.encoded_size,
                kind,
                kmd: template.kmd.clone(),
                priority: template.priority,
                lifetime: template.lifetime,
                status: PrefetchStatus::NoPrefetch,
                action: template.action,
                counted_in_overall: false,
                obsoleted: None,
            };
            let node = self.new_node(1, u64::from(info.encoded_size), false, request);
            self.nodes.insert(pointer.id, node);
        }

        let node = self
            .nodes
            .get_mut(&pointer.id)
            .ok_or_else(|| InvariantViolation::bare(ViolationKind::MissingNode, pointer.id))?;
        let new_action = template.action.combine(node.request.action);
        if is_new || node.request.action != new_action {
            node.request.action = new_action;
            if !node.triggered {
                self.overall.add_total(&mut node.request);
            } else if !is_new {
                // The subtree was walked under the weaker action.
                node.retrigger = true;
            }
            let receiver = self.retriever.request(
                node.scope.clone(),
                node.request.block_request(template.priority, template.action),
            );
            if self.in_flight.send(InFlight { pointer, receiver }).is_err() {
                debug!(block = %pointer, "In-flight tracker has stopped");
            }
        }

        node.drop_closed_edge(pointer.ref_nonce, &parent);
        if !node.has_edge(pointer.ref_nonce, &parent) || parent_is_new {
            node.add_edge(pointer.ref_nonce, parent, parent_wait);
            if node.pending > 0 {
                debug!(
                    block = %pointer,
                    action = %template.action,
                    pending = node.pending,
                    parent_is_new,
                    "Prefetching child block"
                );
            }
            return Ok(SubtreeCounts {
                blocks: node.pending,
                fetched: node.progress.bytes_fetched,
                total: node.progress.bytes_total,
            });
        }
        Ok(SubtreeCounts::default())
    }
}

/// Direct directory children in ascending entry size, ties by name.
/// Symlinks have no block to fetch.
fn direct_dir_children(dir: &DirBlock) -> Vec<(BlockInfo, BlockKind)> {
    let mut entries: Vec<_> = dir.children.iter().collect();
    entries.sort_by_key(|(_, entry)| entry.size);
    entries
        .into_iter()
        .filter_map(|(name, entry)| match entry.entry_type {
            EntryType::File | EntryType::Exec => Some((entry.info, BlockKind::File)),
            EntryType::Dir => Some((entry.info, BlockKind::Dir)),
            EntryType::Symlink => None,
            EntryType::Unknown(kind) => {
                debug!(entry = %name, kind, "Skipping prefetch for entry of unknown type");
                None
            }
        })
        .collect()
}
