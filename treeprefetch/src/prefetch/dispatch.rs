//! The dispatch loop.
//!
//! One task owns the forest and is the only place it is mutated. Everything
//! else reaches it through the event queues in [`super::request`]. A second
//! task, the in-flight tracker, watches every retrieval the loop issues so
//! that shutdown can wait for them and failed retrievals cancel their
//! subtree.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::action::{PrefetchAction, PrefetchStatus};
use crate::block::{Block, BlockId, BlockPointer};
use crate::cache::{BlockCache, BlockRetriever, DiskBlockCache, RequestScope};
use crate::error::{FaultHandler, InvariantViolation, PrefetchError, RetrievalError, ViolationKind};
use crate::prefetch::backpressure::{Backpressure, StopDecision};
use crate::prefetch::node::{CompletionSignal, PrefetchNode};
use crate::prefetch::overall::OverallProgress;
use crate::prefetch::policy::Priority;
use crate::prefetch::queued::QueuedTriggers;
use crate::prefetch::request::{
    EventReceivers, EventSender, InFlight, PrefetchRequest, RequestEvent, StatusQuery, VolumeCancel,
};
use crate::prefetch::tree::{Forest, WalkOutcome};

// =============================================================================
// In-flight tracker
// =============================================================================

/// Waits on every retrieval issued by the loop.
///
/// A retrieval that fails for any reason other than cancellation turns into
/// a cancel event for its pointer. Once shutdown begins, the tracker waits
/// for everything still outstanding, then hands the queue back to the loop
/// through `almost_done`.
pub(crate) async fn track_in_flight(
    mut in_flight: mpsc::UnboundedReceiver<InFlight>,
    events: EventSender,
    shutdown: CancellationToken,
    almost_done: oneshot::Sender<mpsc::UnboundedReceiver<InFlight>>,
) {
    let mut pending = FuturesUnordered::new();
    let mut open = true;

    loop {
        if !open && pending.is_empty() {
            break;
        }
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            item = in_flight.recv(), if open => match item {
                Some(item) => pending.push(watch(item)),
                // The dispatch loop is gone.
                None => open = false,
            },

            Some((pointer, result)) = pending.next(), if !pending.is_empty() => {
                report_failure(&events, pointer, result);
            }
        }
    }

    debug!(outstanding = pending.len(), "Draining in-flight retrievals");
    loop {
        while let Ok(item) = in_flight.try_recv() {
            pending.push(watch(item));
        }
        if pending.next().await.is_none() {
            break;
        }
    }

    if almost_done.send(in_flight).is_err() {
        debug!("Dispatch loop exited before in-flight drain finished");
    }
}

async fn watch(item: InFlight) -> (BlockPointer, Result<Arc<Block>, RetrievalError>) {
    let result = item
        .receiver
        .await
        .unwrap_or(Err(RetrievalError::Cancelled));
    (item.pointer, result)
}

fn report_failure(
    events: &EventSender,
    pointer: BlockPointer,
    result: Result<Arc<Block>, RetrievalError>,
) {
    match result {
        Ok(_) => trace!(block = %pointer, "Retrieval finished"),
        Err(e) if e.is_cancelled() => trace!(block = %pointer, "Retrieval cancelled"),
        Err(e) => {
            warn!(block = %pointer, error = %e, "Prefetch retrieval failed, cancelling subtree");
            events.cancel(pointer);
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Collaborators the loop uses directly, outside the forest.
pub(crate) struct DispatchDeps {
    pub retriever: Arc<dyn BlockRetriever>,
    pub block_cache: Arc<dyn BlockCache>,
    pub disk_cache: Option<Arc<dyn DiskBlockCache>>,
    pub overall: Arc<OverallProgress>,
    pub backpressure: Arc<Backpressure>,
    pub fault_handler: Arc<dyn FaultHandler>,
    pub queued: Arc<QueuedTriggers>,
}

enum LoopEvent {
    Status(StatusQuery),
    AlmostDone(Option<mpsc::UnboundedReceiver<InFlight>>),
    InFlight(InFlight),
    Cancel(BlockPointer),
    VolumeCancel(VolumeCancel),
    Reschedule(PrefetchRequest),
    Request(RequestEvent),
}

pub(crate) struct Dispatcher {
    forest: Forest,
    receivers: EventReceivers,
    events: EventSender,
    deps: DispatchDeps,
    almost_done: oneshot::Receiver<mpsc::UnboundedReceiver<InFlight>>,
    done: CompletionSignal,
    root: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        forest: Forest,
        receivers: EventReceivers,
        events: EventSender,
        deps: DispatchDeps,
        almost_done: oneshot::Receiver<mpsc::UnboundedReceiver<InFlight>>,
        done: CompletionSignal,
        root: CancellationToken,
    ) -> Self {
        Self {
            forest,
            receivers,
            events,
            deps,
            almost_done,
            done,
            root,
        }
    }

    /// Runs until shutdown has drained every queue, or until an invariant
    /// violation.
    pub async fn run(mut self) {
        let mut shutting_down = false;
        let mut in_flight: Option<mpsc::UnboundedReceiver<InFlight>> = None;

        loop {
            if shutting_down
                && self.receivers.is_empty()
                && in_flight.as_ref().map_or(true, |rx| rx.is_empty())
            {
                break;
            }

            // Status queries go first so observers never wait on tree work.
            if let Ok(query) = self.receivers.statuses.try_recv() {
                self.forest.answer_status(query);
                continue;
            }

            let event = tokio::select! {
                biased;

                Some(query) = self.receivers.statuses.recv() => LoopEvent::Status(query),

                drained = &mut self.almost_done, if !shutting_down => {
                    LoopEvent::AlmostDone(drained.ok())
                }

                Some(item) = next_in_flight(&mut in_flight), if shutting_down => {
                    LoopEvent::InFlight(item)
                }

                Some(pointer) = self.receivers.cancels.recv() => LoopEvent::Cancel(pointer),

                Some(request) = self.receivers.volume_cancels.recv() => {
                    LoopEvent::VolumeCancel(request)
                }

                Some(request) = self.receivers.reschedules.recv() => LoopEvent::Reschedule(request),

                Some(event) = self.receivers.requests.recv() => LoopEvent::Request(event),

                else => break,
            };

            let result = match event {
                LoopEvent::Status(query) => {
                    self.forest.answer_status(query);
                    Ok(())
                }
                LoopEvent::AlmostDone(drained) => {
                    debug!("Starting prefetcher shutdown");
                    shutting_down = true;
                    in_flight = drained;
                    self.forest.clear_all_reschedules();
                    Ok(())
                }
                LoopEvent::InFlight(item) => {
                    debug!(block = %item.pointer, "Waiting for retrieval during shutdown");
                    let _ = item.receiver.await;
                    Ok(())
                }
                LoopEvent::Cancel(pointer) => self.forest.cancel(pointer).map(|_| ()),
                LoopEvent::VolumeCancel(request) => {
                    self.forest.cancel_volume(request.volume);
                    let _ = request.reply.send(());
                    Ok(())
                }
                LoopEvent::Reschedule(request) => self.forest.reschedule(request),
                LoopEvent::Request(RequestEvent::WaitChannel { pointer, reply }) => {
                    let _ = reply.send(self.forest.wait_signal(&pointer));
                    Ok(())
                }
                LoopEvent::Request(RequestEvent::Prefetch(request)) => {
                    self.handle_request(request).await
                }
            };

            if let Err(violation) = result {
                self.fault(&violation);
                break;
            }
        }

        self.root.cancel();
        self.forest.close_all();
        self.done.close();
        info!("Prefetcher stopped");
    }

    fn fault(&self, violation: &InvariantViolation) {
        error!(
            kind = %violation.kind,
            block = %violation.block,
            pending = violation.pending,
            bytes_fetched = violation.bytes_fetched,
            bytes_total = violation.bytes_total,
            parents = ?violation.parents,
            "Prefetch invariant violated"
        );
        self.deps.fault_handler.on_invariant_violation(violation);
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn handle_request(&mut self, request: PrefetchRequest) -> Result<(), InvariantViolation> {
        let pointer = request.pointer;
        let id = pointer.id;
        self.forest.clear_reschedule_state(&id);

        if request.is_obsoleted() {
            debug!(block = %pointer, action = %request.action, "Request cancelled while queued");
            return Ok(());
        }
        self.deps.queued.mark_done(&pointer);

        let exists = self.forest.contains(&id);
        debug!(block = %pointer, action = %request.action, "Handling prefetch request");

        let scope = self.forest.scope_for(&id);
        let block = match self.fetch_block(scope, &request, request.action.solo_action()).await {
            Ok(block) => block,
            Err(e) => {
                warn!(block = %pointer, error = %e, "Error requesting block");
                return Ok(());
            }
        };

        // Finished blocks and tails have nothing left to prefetch.
        if request.status == PrefetchStatus::Finished || block.is_tail() {
            if exists {
                return self.finish_subtree(id).await;
            }
            debug!(block = %pointer, "Skipping prefetch for finished block");
            self.forest.forget_reschedule(&id);
            if request.status != PrefetchStatus::Finished {
                self.mark_finished(&request, block).await;
            }
            return Ok(());
        }

        if !request.action.prefetch(&block) {
            debug!(block = %pointer, action = %request.action, "Skipping prefetch for block");
            let existing_prefetches = self
                .forest
                .node(&id)
                .is_some_and(|node| node.request.action.prefetch(&block));
            if exists && !existing_prefetches {
                self.forest.cancel(pointer)?;
            }
            return Ok(());
        }

        let already_triggered = request.status == PrefetchStatus::Triggered
            && !request.action.deep_sync()
            && self.forest.node(&id).is_some_and(|node| {
                node.request.action.sync() == request.action.sync()
                    && node.request.action.stop_if_full() == request.action.stop_if_full()
                    && !node.retrigger
            });
        if already_triggered {
            debug!(block = %pointer, "Prefetch already triggered");
            return Ok(());
        }

        // Bail out before enqueuing children the cache cannot hold.
        match self.deps.backpressure.check(&request).await {
            StopDecision::Proceed => {}
            StopDecision::Reschedule => {
                self.events.reschedule(request);
                return Ok(());
            }
            StopDecision::Stop { cancel } => {
                if cancel && exists {
                    self.forest.cancel(pointer)?;
                }
                return Ok(());
            }
        }

        if exists && !self.update_existing(&request, &block)? {
            return Ok(());
        }
        if !exists {
            debug!(block = %pointer, "Created new prefetch");
            self.forest.insert_root(request.clone());
        }

        let outcome = self.forest.handle_prefetch(
            id,
            !exists,
            request.action,
            &block,
            &mut self.receivers.statuses,
        )?;
        match outcome {
            WalkOutcome::UnknownKind => {
                warn!(block = %pointer, "Error handling prefetch: unknown block kind");
                if exists {
                    // Its own block is counted; nothing below it ever will be.
                    let finished = self.forest.complete(id, 0, 0)?;
                    self.finish_nodes(finished).await;
                } else {
                    self.forest.remove(&id);
                }
            }
            WalkOutcome::Tail => {
                debug!(block = %pointer, "Completed prefetch for tail block");
                let finished = self.forest.complete(id, 0, 0)?;
                self.finish_nodes(finished).await;
            }
            WalkOutcome::Children(counts) if counts.blocks == 0 => {
                debug!(block = %pointer, "No blocks to prefetch");
                if !exists {
                    let finished = self.forest.complete(id, 0, 0)?;
                    self.finish_nodes(finished).await;
                }
            }
            WalkOutcome::Children(counts) => {
                debug!(
                    block = %pointer,
                    blocks = counts.blocks,
                    bytes_fetched = counts.fetched,
                    bytes_total = counts.total,
                    "Prefetching children"
                );
                self.forest.add_subtree(id, counts)?;
                self.record_triggered(&request).await;
            }
        }
        Ok(())
    }

    /// Updates a node already in the forest for a newly fetched request.
    /// Returns false when its children need no new walk.
    fn update_existing(
        &mut self,
        request: &PrefetchRequest,
        block: &Block,
    ) -> Result<bool, InvariantViolation> {
        let pointer = request.pointer;
        let id = pointer.id;
        let Some(node) = self.forest.node(&id) else {
            return Ok(false);
        };

        if node.triggered {
            debug!(block = %pointer, "Prefetch subtree already triggered");
            if node.pending == 0 {
                // Only this block is left and it was not walked to its tail.
                self.forest.cancel(pointer)?;
            }
            let Some(node) = self.forest.node_mut(&id) else {
                return Ok(false);
            };
            let new_action = node.request.action.combine(request.action);
            if new_action != node.request.action {
                node.request.action = new_action;
                node.retrigger = false;
                return Ok(true);
            }
            if node.retrigger {
                node.retrigger = false;
                return Ok(true);
            }
            return Ok(false);
        }

        // Counted as pending in the tree; its own block is now fetched.
        if node.pending == 0 {
            return Err(node.violation(ViolationKind::UntriggeredWithoutPending));
        }
        self.forest.decrement(id)?;
        self.forest.add_fetched(id, u64::from(block.encoded_size()))?;
        let node = self
            .forest
            .node_mut(&id)
            .ok_or_else(|| InvariantViolation::bare(ViolationKind::MissingNode, id))?;
        node.triggered = true;
        node.request.action = node.request.action.combine(request.action);
        self.deps.overall.add_fetched(&mut node.request)?;
        Ok(true)
    }

    /// Completes a node whose whole subtree is done.
    async fn finish_subtree(&mut self, id: BlockId) -> Result<(), InvariantViolation> {
        let Some(node) = self.forest.node_mut(&id) else {
            return Ok(());
        };
        let blocks = node.pending;
        let remaining = node.progress.bytes_total.saturating_sub(node.progress.bytes_fetched);
        self.deps.overall.add_fetched(&mut node.request)?;
        let finished = self.forest.complete(id, blocks, remaining)?;
        self.finish_nodes(finished).await;
        Ok(())
    }

    /// Marks completed nodes finished in the caches, then closes them.
    async fn finish_nodes(&self, nodes: Vec<PrefetchNode>) {
        for node in nodes {
            let request = &node.request;
            match self.fetch_block(node.scope.clone(), request, PrefetchAction::SOLO).await {
                Ok(block) => {
                    let result = self
                        .deps
                        .retriever
                        .put_in_caches(
                            &node.scope,
                            request.pointer,
                            request.volume(),
                            block,
                            request.lifetime,
                            PrefetchStatus::Finished,
                            request.action.cache_kind(),
                        )
                        .await;
                    if let Err(e) = result {
                        warn!(block = %request.pointer, error = %e, "Failed to complete prefetch due to cache error");
                    }
                }
                Err(e) => {
                    warn!(block = %request.pointer, error = %e, "Failed to retrieve block to complete its prefetch");
                }
            }
            debug!(block = %request.pointer, "Prefetch complete");
            node.close();
        }
    }

    async fn mark_finished(&self, request: &PrefetchRequest, block: Arc<Block>) {
        let scope = self.forest.scope_for(&request.pointer.id);
        let result = self
            .deps
            .retriever
            .put_in_caches(
                &scope,
                request.pointer,
                request.volume(),
                block,
                request.lifetime,
                PrefetchStatus::Finished,
                request.action.cache_kind(),
            )
            .await;
        if let Err(e) = result {
            debug!(block = %request.pointer, error = %e, "Couldn't put finished block in cache");
        }
    }

    /// Records on disk that the block's children have been enqueued.
    async fn record_triggered(&self, request: &PrefetchRequest) {
        let Some(disk_cache) = self.deps.disk_cache.as_ref() else {
            return;
        };
        let result = disk_cache
            .update_metadata(
                request.volume(),
                request.pointer.id,
                PrefetchStatus::Triggered,
                request.action.cache_kind(),
            )
            .await;
        if let Err(e) = result {
            debug!(block = %request.pointer, error = %e, "Couldn't update block metadata");
        }
    }

    /// Gets a block from the memory cache, or retrieves it and waits.
    async fn fetch_block(
        &self,
        scope: RequestScope,
        request: &PrefetchRequest,
        action: PrefetchAction,
    ) -> Result<Arc<Block>, PrefetchError> {
        match self.deps.block_cache.get(&request.pointer).await {
            Ok(Some(block)) => return Ok(block),
            Ok(None) => {}
            Err(e) => trace!(block = %request.pointer, error = %e, "Memory cache lookup failed"),
        }

        let receiver = self
            .deps
            .retriever
            .request(scope, request.block_request(Priority::ON_DEMAND, action));
        match receiver.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RetrievalError::Cancelled.into()),
        }
    }
}

async fn next_in_flight(in_flight: &mut Option<mpsc::UnboundedReceiver<InFlight>>) -> Option<InFlight> {
    match in_flight {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
