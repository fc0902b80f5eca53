//! Per-worker log buffers and the pool recycling them through the logger.

use std::sync::Arc;

use common::{
    backoff::SpinWait,
    knobs::{
        BUFFER_NUM,
        MAX_BUFFERED_LOG_ENTRIES,
    },
    TidWord,
};
use parking_lot::Mutex;

use crate::{
    metrics,
    notifier::NotificationId,
    queue::LogQueue,
    wire::{
        LogEntry,
        LogRecord,
        LogSet,
    },
};

/// A fixed-capacity batch of log records, never straddling an epoch
/// boundary.
pub struct LogBuffer {
    records: Vec<LogRecord>,
    nids: Vec<NotificationId>,
    min_epoch: u64,
    max_epoch: u64,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            nids: Vec::new(),
            min_epoch: u64::MAX,
            max_epoch: 0,
        }
    }

    fn push(&mut self, tid: TidWord, nid: NotificationId, entries: &[LogEntry]) {
        for entry in entries {
            self.records.push(LogRecord {
                tid: tid.raw(),
                op_type: entry.op,
                key: entry.key.clone(),
                val: entry.val.clone(),
                prev_hash: String::new(),
            });
        }
        if entries.is_empty() {
            return;
        }
        self.nids.push(nid);

        let epoch = tid.epoch();
        self.min_epoch = self.min_epoch.min(epoch);
        self.max_epoch = self.max_epoch.max(epoch);
        debug_assert_eq!(self.min_epoch, self.max_epoch);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nids.is_empty()
    }

    pub fn min_epoch(&self) -> u64 {
        self.min_epoch
    }

    /// Drain the buffered notification ids for the notifier.
    pub fn take_nids(&mut self) -> Vec<NotificationId> {
        std::mem::take(&mut self.nids)
    }

    /// Turn the buffered records into a hashed log set, emptying the buffer
    /// for reuse.
    pub fn assemble(&mut self, prev_epoch_hash: String) -> LogSet {
        debug_assert!(!self.records.is_empty());
        let records = std::mem::take(&mut self.records);
        self.min_epoch = u64::MAX;
        self.max_epoch = 0;
        LogSet::assemble(prev_epoch_hash, records)
    }
}

/// A buffer in flight to a logger, carrying the pool slot it returns to.
pub struct PublishedBuffer {
    pub buffer: LogBuffer,
    home: Arc<Mutex<Vec<LogBuffer>>>,
}

impl PublishedBuffer {
    /// Give the (drained) buffer back to its worker's pool.
    pub fn recycle(mut self) {
        debug_assert!(self.buffer.records.is_empty());
        debug_assert!(self.buffer.nids.is_empty());
        self.buffer.min_epoch = u64::MAX;
        self.buffer.max_epoch = 0;
        let home = Arc::clone(&self.home);
        home.lock().push(self.buffer);
    }
}

/// Each worker's ring of log buffers. Full or epoch-closing buffers are
/// published to the worker's logger queue; the logger recycles them after
/// writing.
pub struct LogBufferPool {
    queue: Arc<LogQueue>,
    home: Arc<Mutex<Vec<LogBuffer>>>,
    current: Option<LogBuffer>,
    quit: bool,
}

impl LogBufferPool {
    pub fn new(queue: Arc<LogQueue>) -> Self {
        let buffer_num = (*BUFFER_NUM).max(2);
        let spares: Vec<LogBuffer> = (0..buffer_num - 1).map(|_| LogBuffer::new()).collect();
        Self {
            queue,
            home: Arc::new(Mutex::new(spares)),
            current: Some(LogBuffer::new()),
            quit: false,
        }
    }

    /// True once a current buffer is available (grabbing one from the pool
    /// if needed) or the pool is quitting.
    pub fn is_ready(&mut self) -> bool {
        if self.current.is_some() || self.quit {
            return true;
        }
        if let Some(buffer) = self.home.lock().pop() {
            self.current = Some(buffer);
            return true;
        }
        false
    }

    /// Whether the open buffer holds records not yet published.
    pub fn has_buffered_content(&self) -> bool {
        self.current
            .as_ref()
            .map(|buffer| !buffer.records.is_empty())
            .unwrap_or(false)
    }

    /// Append a committed transaction's write set. Publishes the open
    /// buffer first when it is full or the transaction opens a new epoch.
    pub fn push(
        &mut self,
        tid: TidWord,
        nid: NotificationId,
        entries: &[LogEntry],
        new_epoch_begins: bool,
    ) {
        let over_capacity = self
            .current
            .as_ref()
            .map(|buffer| buffer.len() > *MAX_BUFFERED_LOG_ENTRIES)
            .unwrap_or(false);
        if over_capacity || new_epoch_begins {
            self.publish();
        }

        let mut spin = SpinWait::new();
        while !self.is_ready() {
            spin.spin();
        }
        if self.quit {
            return;
        }
        let buffer = self.current.as_mut().expect("is_ready() ensured a buffer");
        buffer.push(tid, nid, entries);
    }

    /// Move the open buffer (if it has content) onto the logger queue.
    pub fn publish(&mut self) {
        let mut spin = SpinWait::new();
        while !self.is_ready() {
            spin.spin();
        }
        if let Some(buffer) = self.current.take() {
            if buffer.is_empty() {
                self.current = Some(buffer);
                return;
            }
            metrics::log_buffer_published(buffer.len());
            self.queue.enq(PublishedBuffer {
                buffer,
                home: Arc::clone(&self.home),
            });
        }
    }

    /// Flush the open buffer and refuse further pushes.
    pub fn terminate(&mut self) {
        self.quit = true;
        if self.current.is_some() {
            self.publish();
        }
    }
}
