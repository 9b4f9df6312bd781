//! Queued-trigger tracking.
//!
//! Every trigger waiting in the request queue shares one "obsoleted"
//! signal per block pointer. Cancelling the pointer closes that signal, and
//! the dispatch loop drops any dequeued trigger whose signal is closed.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::block::BlockPointer;
use crate::prefetch::node::CompletionSignal;

#[derive(Debug)]
struct QueuedEntry {
    waiting: usize,
    obsoleted: CompletionSignal,
}

/// Outstanding triggers per block pointer.
#[derive(Debug, Default)]
pub(crate) struct QueuedTriggers {
    entries: Mutex<HashMap<BlockPointer, QueuedEntry>>,
}

impl QueuedTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more queued trigger and returns the shared signal.
    pub fn register(&self, pointer: BlockPointer) -> CompletionSignal {
        let mut entries = self.entries.lock();
        let entry = entries.entry(pointer).or_insert_with(|| QueuedEntry {
            waiting: 0,
            obsoleted: CompletionSignal::new(),
        });
        entry.waiting += 1;
        entry.obsoleted.clone()
    }

    /// Called when the loop dequeues a live trigger.
    pub fn mark_done(&self, pointer: &BlockPointer) {
        let mut entries = self.entries.lock();
        match entries.get_mut(pointer) {
            Some(entry) if entry.waiting > 1 => entry.waiting -= 1,
            Some(_) => {
                entries.remove(pointer);
            }
            None => debug!(block = %pointer, "No queued prefetch to mark done"),
        }
    }

    /// Obsoletes every queued trigger for the pointer.
    pub fn cancel(&self, pointer: BlockPointer) -> bool {
        match self.entries.lock().remove(&pointer) {
            Some(entry) => {
                entry.obsoleted.close();
                debug!(block = %pointer, "Cancelled queued prefetch");
                true
            }
            None => {
                debug!(block = %pointer, "No queued prefetch to cancel");
                false
            }
        }
    }

    /// Number of triggers still queued for the pointer.
    pub fn waiting(&self, pointer: &BlockPointer) -> usize {
        self.entries.lock().get(pointer).map_or(0, |e| e.waiting)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
