//! Per-logger queue of published log buffers, ordered by epoch.

use std::{
    collections::BTreeMap,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

use common::knobs::EPOCH_DURATION;
use parking_lot::Mutex;

use crate::buffer::PublishedBuffer;

/// Buffers keyed by their epoch so the logger always drains lower epochs
/// first, preserving epoch order across the workers sharing it.
pub struct LogQueue {
    inner: Mutex<BTreeMap<u64, Vec<PublishedBuffer>>>,
    data_added: AtomicBool,
    quit: AtomicBool,
    timeout: Duration,
}

impl LogQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            data_added: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            timeout: *EPOCH_DURATION,
        }
    }

    pub fn enq(&self, buffer: PublishedBuffer) {
        let mut inner = self.inner.lock();
        inner
            .entry(buffer.buffer.min_epoch())
            .or_default()
            .push(buffer);
        self.data_added.store(true, Ordering::Release);
    }

    /// Wait (bounded by the epoch period) for work. Returns true when the
    /// queue has data or is quitting, false on timeout so the logger can do
    /// its idle durable-epoch bookkeeping.
    pub fn wait_deq(&self) -> bool {
        if self.is_quitting() || !self.is_empty() {
            return true;
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.data_added.swap(false, Ordering::AcqRel) || self.is_quitting() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_micros(50));
        }
    }

    /// Drain every queued buffer, lowest epoch first.
    pub fn deq(&self) -> Vec<PublishedBuffer> {
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut *inner);
        drained.into_values().flatten().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// The smallest epoch with a queued buffer.
    pub fn min_epoch(&self) -> Option<u64> {
        self.inner.lock().keys().next().copied()
    }

    pub fn terminate(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}
