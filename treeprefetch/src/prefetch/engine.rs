//! Public handle to a running prefetch engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{PrefetchAction, PrefetchStatus};
use crate::block::{Block, BlockPointer, CacheLifetime, KeyMetadata, VolumeId};
use crate::cache::{
    BlockCache, BlockRetriever, Clock, DiskBlockCache, LogReporter, Reporter, RequestScope,
    SettingsDb, SystemClock,
};
use crate::config::PrefetcherConfig;
use crate::error::{AbortOnFault, CacheError, FaultHandler, PrefetchError};
use crate::prefetch::backpressure::{Backpressure, StopDecision};
use crate::prefetch::dispatch::{track_in_flight, DispatchDeps, Dispatcher};
use crate::prefetch::node::CompletionSignal;
use crate::prefetch::overall::OverallProgress;
use crate::prefetch::policy::Priority;
use crate::prefetch::queued::QueuedTriggers;
use crate::prefetch::request::{event_channels, EventSender, PrefetchRequest, StatusQuery, VolumeCancel};
use crate::prefetch::tree::Forest;
use crate::progress::PrefetchProgress;

/// Collaborators handed to [`Prefetcher::start`].
#[derive(Clone)]
pub struct PrefetcherDeps {
    pub retriever: Arc<dyn BlockRetriever>,
    pub block_cache: Arc<dyn BlockCache>,
    pub disk_cache: Option<Arc<dyn DiskBlockCache>>,
    pub clock: Arc<dyn Clock>,
    pub reporter: Arc<dyn Reporter>,
    pub settings: Option<Arc<dyn SettingsDb>>,
    pub fault_handler: Arc<dyn FaultHandler>,
}

impl PrefetcherDeps {
    /// Dependencies with the system clock, a logging reporter, no disk
    /// cache, no settings and an aborting fault handler.
    pub fn new(retriever: Arc<dyn BlockRetriever>, block_cache: Arc<dyn BlockCache>) -> Self {
        Self {
            retriever,
            block_cache,
            disk_cache: None,
            clock: Arc::new(SystemClock),
            reporter: Arc::new(LogReporter),
            settings: None,
            fault_handler: Arc::new(AbortOnFault),
        }
    }

    pub fn with_disk_cache(mut self, disk_cache: Arc<dyn DiskBlockCache>) -> Self {
        self.disk_cache = Some(disk_cache);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsDb>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_fault_handler(mut self, fault_handler: Arc<dyn FaultHandler>) -> Self {
        self.fault_handler = fault_handler;
        self
    }
}

struct PrefetcherInner {
    events: EventSender,
    retriever: Arc<dyn BlockRetriever>,
    backpressure: Arc<Backpressure>,
    overall: Arc<OverallProgress>,
    shutdown: CancellationToken,
    root: CancellationToken,
    done: CompletionSignal,
    node_timeout: Duration,
}

/// Handle to a running prefetch engine. Clones share the same engine.
///
/// # Example
///
/// ```ignore
/// let prefetcher = Prefetcher::start(PrefetcherConfig::default(), deps);
/// prefetcher
///     .process_block_for_prefetch(ptr, block, kmd, Priority::ON_DEMAND,
///         CacheLifetime::Transient, PrefetchStatus::NoPrefetch,
///         PrefetchAction::WITH_DEEP_SYNC)
///     .await;
/// let signal = prefetcher.wait_channel_for_block_prefetch(&token, ptr).await?;
/// signal.wait().await;
/// prefetcher.shutdown().wait().await;
/// ```
#[derive(Clone)]
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
}

impl Prefetcher {
    /// Spawns the dispatch loop and the in-flight tracker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: PrefetcherConfig, deps: PrefetcherDeps) -> Self {
        let shutdown = CancellationToken::new();
        let root = CancellationToken::new();
        let queued = Arc::new(QueuedTriggers::new());
        let (events, receivers) = event_channels(Arc::clone(&queued), shutdown.clone());

        let overall = Arc::new(OverallProgress::new(
            deps.reporter,
            deps.disk_cache.clone(),
            Arc::clone(&deps.clock),
            config.overall_status_interval,
        ));
        let backpressure = Arc::new(Backpressure::new(
            deps.disk_cache.clone(),
            deps.settings,
            config.low_space_threshold_bytes,
            Arc::clone(&overall),
        ));

        let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();
        let (almost_done_tx, almost_done_rx) = oneshot::channel();
        tokio::spawn(track_in_flight(
            in_flight_rx,
            events.clone(),
            shutdown.clone(),
            almost_done_tx,
        ));

        let forest = Forest::new(
            Arc::clone(&deps.retriever),
            Arc::clone(&overall),
            events.clone(),
            in_flight_tx,
            root.clone(),
            deps.clock,
            &config,
        );
        let done = CompletionSignal::new();
        let dispatcher = Dispatcher::new(
            forest,
            receivers,
            events.clone(),
            DispatchDeps {
                retriever: Arc::clone(&deps.retriever),
                block_cache: deps.block_cache,
                disk_cache: deps.disk_cache,
                overall: Arc::clone(&overall),
                backpressure: Arc::clone(&backpressure),
                fault_handler: deps.fault_handler,
                queued,
            },
            almost_done_rx,
            done.clone(),
            root.clone(),
        );
        tokio::spawn(dispatcher.run());

        info!(
            node_timeout_secs = config.node_timeout.as_secs(),
            status_interval_ms = config.overall_status_interval.as_millis() as u64,
            "Prefetcher started"
        );

        Self {
            inner: Arc::new(PrefetcherInner {
                events,
                retriever: deps.retriever,
                backpressure,
                overall,
                shutdown,
                root,
                done,
                node_timeout: config.node_timeout,
            }),
        }
    }

    /// Hands a freshly fetched block to the engine.
    ///
    /// The block is written to the caches (marked `Triggered` when its
    /// children will be prefetched) and a prefetch request is queued. A
    /// failed cache write cancels the pointer unless the cache is full and
    /// the request was rescheduled instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_block_for_prefetch(
        &self,
        pointer: BlockPointer,
        block: Arc<Block>,
        kmd: KeyMetadata,
        priority: Priority,
        lifetime: CacheLifetime,
        status: PrefetchStatus,
        action: PrefetchAction,
    ) {
        let request = PrefetchRequest {
            pointer,
            encoded_size: block.encoded_size(),
            kind: block.kind(),
            kmd,
            priority,
            lifetime,
            status,
            action,
            counted_in_overall: false,
            obsoleted: None,
        };

        if status == PrefetchStatus::Finished {
            // Already cached as finished.
        } else if !action.prefetch(&block) {
            if let Err(e) = self.put_in_caches(&request, block, status).await {
                debug!(block = %pointer, error = %e, "Couldn't cache block");
            }
        } else if self
            .cache_or_cancel(&request, block, PrefetchStatus::Triggered)
            .await
            .is_err()
        {
            return;
        }
        self.inner.events.trigger(request);
    }

    async fn put_in_caches(
        &self,
        request: &PrefetchRequest,
        block: Arc<Block>,
        status: PrefetchStatus,
    ) -> Result<(), CacheError> {
        let scope = RequestScope::new(
            self.inner.root.child_token(),
            Instant::now() + self.inner.node_timeout,
        );
        self.inner
            .retriever
            .put_in_caches(
                &scope,
                request.pointer,
                request.volume(),
                block,
                request.lifetime,
                status,
                request.action.cache_kind(),
            )
            .await
    }

    async fn cache_or_cancel(
        &self,
        request: &PrefetchRequest,
        block: Arc<Block>,
        status: PrefetchStatus,
    ) -> Result<(), CacheError> {
        let result = self.put_in_caches(request, block, status).await;
        if let Err(e) = &result {
            // A full cache also fails the write, so check before giving up.
            match self.inner.backpressure.check(request).await {
                StopDecision::Reschedule => self.inner.events.reschedule(request.clone()),
                StopDecision::Stop { cancel } => {
                    if cancel {
                        self.cancel_prefetch(request.pointer);
                    }
                }
                StopDecision::Proceed => {
                    warn!(block = %request.pointer, error = %e, "Error prefetching block, cancelling");
                    self.cancel_prefetch(request.pointer);
                }
            }
        }
        result
    }

    /// Returns a signal closed when the block's prefetch subtree finishes or
    /// is cancelled. The signal is already closed for an unknown block.
    ///
    /// The query rides the request queue, so every trigger queued before it
    /// has been processed when it is answered.
    pub async fn wait_channel_for_block_prefetch(
        &self,
        cancel: &CancellationToken,
        pointer: BlockPointer,
    ) -> Result<CompletionSignal, PrefetchError> {
        if cancel.is_cancelled() {
            return Err(PrefetchError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        if !self.inner.events.wait_channel(pointer, reply) {
            return Err(PrefetchError::ShutDown);
        }
        self.await_reply(cancel, rx).await
    }

    /// Progress of the block's subtree, zero for an unknown block.
    pub async fn status(
        &self,
        cancel: &CancellationToken,
        pointer: BlockPointer,
    ) -> Result<PrefetchProgress, PrefetchError> {
        if cancel.is_cancelled() {
            return Err(PrefetchError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        if !self.inner.events.status(StatusQuery { pointer, reply }) {
            return Err(PrefetchError::ShutDown);
        }
        self.await_reply(cancel, rx).await
    }

    /// Aggregate progress of all sync prefetches.
    pub fn overall_sync_status(&self) -> PrefetchProgress {
        self.inner.overall.snapshot()
    }

    /// Cancels the pointer's prefetch and any queued trigger for it.
    pub fn cancel_prefetch(&self, pointer: BlockPointer) {
        self.inner.events.cancel(pointer);
    }

    /// Removes every prefetch of the volume and waits until it is done.
    pub async fn cancel_tlf_prefetches(
        &self,
        cancel: &CancellationToken,
        volume: VolumeId,
    ) -> Result<(), PrefetchError> {
        if cancel.is_cancelled() {
            return Err(PrefetchError::Cancelled);
        }
        let (reply, rx) = oneshot::channel();
        if !self.inner.events.cancel_volume(VolumeCancel { volume, reply }) {
            return Err(PrefetchError::ShutDown);
        }
        self.await_reply(cancel, rx).await
    }

    async fn await_reply<T>(
        &self,
        cancel: &CancellationToken,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, PrefetchError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(PrefetchError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(PrefetchError::ShutDown),
            result = reply => result.map_err(|_| PrefetchError::ShutDown),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops accepting new work. The returned signal closes once every
    /// retrieval in flight has finished and the queues are drained.
    pub fn shutdown(&self) -> CompletionSignal {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down prefetcher");
            self.inner.shutdown.cancel();
        }
        self.inner.done.clone()
    }
}
