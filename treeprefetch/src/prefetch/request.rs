//! Requests and the queues that carry them to the dispatch loop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::{PrefetchAction, PrefetchStatus};
use crate::block::{BlockKind, BlockPointer, CacheLifetime, KeyMetadata, VolumeId};
use crate::cache::{BlockRequest, RetrievalReceiver};
use crate::prefetch::node::CompletionSignal;
use crate::prefetch::policy::Priority;
use crate::prefetch::queued::QueuedTriggers;
use crate::progress::PrefetchProgress;

/// A request to prefetch below one block.
#[derive(Clone, Debug)]
pub(crate) struct PrefetchRequest {
    pub pointer: BlockPointer,
    pub encoded_size: u32,
    pub kind: BlockKind,
    pub kmd: KeyMetadata,
    pub priority: Priority,
    pub lifetime: CacheLifetime,
    /// Status the block had in the caches when it was fetched.
    pub status: PrefetchStatus,
    pub action: PrefetchAction,
    /// The block's bytes are part of the aggregate sync total.
    pub counted_in_overall: bool,
    /// Closed when the request was cancelled while still queued.
    pub obsoleted: Option<CompletionSignal>,
}

impl PrefetchRequest {
    pub fn volume(&self) -> VolumeId {
        self.kmd.volume_id()
    }

    /// The retrieval for this request's block under `action`.
    pub fn block_request(&self, priority: Priority, action: PrefetchAction) -> BlockRequest {
        BlockRequest {
            priority,
            kmd: self.kmd.clone(),
            pointer: self.pointer,
            kind: self.kind,
            lifetime: self.lifetime,
            action,
        }
    }

    pub fn is_obsoleted(&self) -> bool {
        self.obsoleted.as_ref().is_some_and(CompletionSignal::is_closed)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events sharing the request queue. Wait-channel queries ride with the
/// prefetch requests so they observe every trigger queued before them.
pub(crate) enum RequestEvent {
    Prefetch(PrefetchRequest),
    WaitChannel {
        pointer: BlockPointer,
        reply: oneshot::Sender<CompletionSignal>,
    },
}

pub(crate) struct StatusQuery {
    pub pointer: BlockPointer,
    pub reply: oneshot::Sender<PrefetchProgress>,
}

pub(crate) struct VolumeCancel {
    pub volume: VolumeId,
    pub reply: oneshot::Sender<()>,
}

/// A retrieval issued by the loop, watched until it completes.
pub(crate) struct InFlight {
    pub pointer: BlockPointer,
    pub receiver: RetrievalReceiver,
}

// =============================================================================
// Queues
// =============================================================================

/// Sending side of the dispatch loop's queues.
///
/// Sends are dropped with a warning once shutdown has begun.
#[derive(Clone)]
pub(crate) struct EventSender {
    requests: mpsc::UnboundedSender<RequestEvent>,
    cancels: mpsc::UnboundedSender<BlockPointer>,
    volume_cancels: mpsc::UnboundedSender<VolumeCancel>,
    reschedules: mpsc::UnboundedSender<PrefetchRequest>,
    statuses: mpsc::UnboundedSender<StatusQuery>,
    queued: Arc<QueuedTriggers>,
    shutdown: CancellationToken,
}

/// Receiving side of the dispatch loop's queues.
pub(crate) struct EventReceivers {
    pub requests: mpsc::UnboundedReceiver<RequestEvent>,
    pub cancels: mpsc::UnboundedReceiver<BlockPointer>,
    pub volume_cancels: mpsc::UnboundedReceiver<VolumeCancel>,
    pub reschedules: mpsc::UnboundedReceiver<PrefetchRequest>,
    pub statuses: mpsc::UnboundedReceiver<StatusQuery>,
}

impl EventReceivers {
    /// True when no event of any kind is waiting.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.cancels.is_empty()
            && self.volume_cancels.is_empty()
            && self.reschedules.is_empty()
            && self.statuses.is_empty()
    }
}

pub(crate) fn event_channels(
    queued: Arc<QueuedTriggers>,
    shutdown: CancellationToken,
) -> (EventSender, EventReceivers) {
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (cancels_tx, cancels) = mpsc::unbounded_channel();
    let (volume_tx, volume_cancels) = mpsc::unbounded_channel();
    let (reschedules_tx, reschedules) = mpsc::unbounded_channel();
    let (statuses_tx, statuses) = mpsc::unbounded_channel();

    let sender = EventSender {
        requests: requests_tx,
        cancels: cancels_tx,
        volume_cancels: volume_tx,
        reschedules: reschedules_tx,
        statuses: statuses_tx,
        queued,
        shutdown,
    };
    let receivers = EventReceivers {
        requests,
        cancels,
        volume_cancels,
        reschedules,
        statuses,
    };
    (sender, receivers)
}

impl EventSender {
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queues a prefetch request, registering it with the queued-trigger
    /// tracker unless it already carries an obsoleted signal.
    pub fn trigger(&self, mut request: PrefetchRequest) {
        if request.obsoleted.is_none() {
            request.obsoleted = Some(self.queued.register(request.pointer));
        }
        if self.is_shut_down() {
            warn!(block = %request.pointer, "Skipping prefetch, prefetcher is shut down");
            return;
        }
        if self.requests.send(RequestEvent::Prefetch(request)).is_err() {
            debug!("Prefetch request queue closed");
        }
    }

    pub fn reschedule(&self, request: PrefetchRequest) {
        if self.is_shut_down() {
            warn!(block = %request.pointer, "Skipping prefetch reschedule, prefetcher is shut down");
            return;
        }
        if self.reschedules.send(request).is_err() {
            debug!("Reschedule queue closed");
        }
    }

    /// Obsoletes any queued trigger for the pointer and queues a cancel.
    pub fn cancel(&self, pointer: BlockPointer) {
        self.queued.cancel(pointer);
        if self.is_shut_down() {
            warn!(block = %pointer, "Skipping prefetch cancel, prefetcher is shut down");
            return;
        }
        if self.cancels.send(pointer).is_err() {
            debug!("Cancel queue closed");
        }
    }

    /// Returns false when the event could not be queued.
    pub fn wait_channel(&self, pointer: BlockPointer, reply: oneshot::Sender<CompletionSignal>) -> bool {
        !self.is_shut_down()
            && self
                .requests
                .send(RequestEvent::WaitChannel { pointer, reply })
                .is_ok()
    }

    pub fn status(&self, query: StatusQuery) -> bool {
        !self.is_shut_down() && self.statuses.send(query).is_ok()
    }

    pub fn cancel_volume(&self, request: VolumeCancel) -> bool {
        !self.is_shut_down() && self.volume_cancels.send(request).is_ok()
    }
}
