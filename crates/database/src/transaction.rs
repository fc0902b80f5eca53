//! The transaction executor: optimistic concurrency control over the index
//! with epoch-grouped write-ahead logging.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            fence,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};

use common::{
    backoff::SpinWait,
    epoch::EpochState,
    shutdown::ShutdownSignal,
    Record,
    Status,
    TidWord,
};
use durability::{
    LogBufferPool,
    LogEntry,
    LogQueue,
    NotificationId,
    OpType,
};
use indexing::{
    GarbageCollector,
    Key,
    Masstree,
};

use crate::{
    metrics,
    reads::{
        ReadElement,
        ReadSet,
    },
    writes::{
        WriteElement,
        WriteSet,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    InFlight,
    Committed,
    Aborted,
}

/// A committed DELETE leaves its record absent in the index; the actual
/// unlink (and the record's reclamation) waits until no concurrent
/// traversal can still reach it.
struct PendingRemoval {
    epoch: u64,
    key: Key,
    record: *const Record,
}

/// One worker's transaction executor. Owns the worker's read/write sets,
/// garbage list, log buffer pool, and epoch bookkeeping duties.
pub struct TxExecutor {
    worker_id: usize,
    tree: Arc<Masstree>,
    epochs: Arc<EpochState>,
    quit: ShutdownSignal,

    status: TransactionStatus,
    read_set: ReadSet,
    write_set: WriteSet,
    max_rset: TidWord,
    max_wset: TidWord,
    /// Most recently chosen commit TID.
    mrctid: TidWord,

    pub gc: GarbageCollector,
    pub log_buffer_pool: LogBufferPool,
    /// Notification id of the in-flight transaction.
    pub nid: NotificationId,
    nid_counter: u64,

    pending_removals: VecDeque<PendingRemoval>,
    epoch_timer_start: Instant,
}

// Raw record pointers in the pending-removal queue follow the same
// reclamation contract as the read/write sets.
unsafe impl Send for TxExecutor {}

impl TxExecutor {
    pub fn new(
        worker_id: usize,
        tree: Arc<Masstree>,
        epochs: Arc<EpochState>,
        queue: Arc<LogQueue>,
        quit: ShutdownSignal,
    ) -> Self {
        Self {
            worker_id,
            tree,
            epochs,
            quit,
            status: TransactionStatus::InFlight,
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            max_rset: TidWord::default(),
            max_wset: TidWord::default(),
            mrctid: TidWord::default(),
            gc: GarbageCollector::new(),
            log_buffer_pool: LogBufferPool::new(queue),
            nid: NotificationId::new(String::new(), 0),
            nid_counter: 0,
            pending_removals: VecDeque::new(),
            epoch_timer_start: Instant::now(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }

    pub fn begin(&mut self, session_id: &str) {
        self.status = TransactionStatus::InFlight;
        self.max_rset = TidWord::default();
        self.max_wset = TidWord::default();
        self.read_set.clear();
        self.write_set.clear();
        self.nid_counter += 1;
        self.nid = NotificationId::new(session_id.to_owned(), self.nid_counter);
    }

    /// Read a key, preferring the transaction's own pending writes, then
    /// its earlier reads, then the index.
    pub fn read(&mut self, key_bytes: &[u8]) -> Result<Vec<u8>, Status> {
        let mut key = Key::from_bytes(key_bytes);
        if let Some(write) = self.write_set.search(&key) {
            if write.op == OpType::Delete {
                return Err(Status::WarnNotFound);
            }
            return Ok(write.new_body.clone());
        }
        if let Some(read) = self.read_set.search(&key) {
            return Ok(read.body.clone());
        }
        let record = match self.tree.get(&mut key) {
            Some(record) => record as *const Record,
            None => return Err(Status::WarnNotFound),
        };
        key.reset();
        self.read_record(key, record)
    }

    /// The read protocol: spin past the lock bit, reject absent records,
    /// copy the body, and re-check the TID word before trusting the copy.
    fn read_record(&mut self, key: Key, record: *const Record) -> Result<Vec<u8>, Status> {
        let mut spin = SpinWait::new();
        let mut expected = unsafe { (*record).load_tid() };
        loop {
            while expected.lock() {
                spin.spin();
                expected = unsafe { (*record).load_tid() };
            }
            if expected.absent() {
                return Err(Status::WarnNotFound);
            }
            let body = unsafe { (*record).read_body() };
            let check = unsafe { (*record).load_tid() };
            if expected == check {
                self.read_set.push(ReadElement {
                    key,
                    record,
                    observed: expected,
                    body: body.clone(),
                });
                return Ok(body);
            }
            expected = check;
        }
    }

    /// Register an overwrite of an existing key.
    pub fn write(&mut self, key_bytes: &[u8], body: &[u8]) -> Status {
        let key = Key::from_bytes(key_bytes);
        if let Some(write) = self.write_set.search_mut(&key) {
            if write.op == OpType::Delete {
                return Status::WarnNotFound;
            }
            write.new_body = body.to_vec();
            return Status::Ok;
        }
        let record = if let Some(read) = self.read_set.search(&key) {
            read.record
        } else {
            let mut lookup = key.clone();
            match self.tree.get(&mut lookup) {
                Some(record) if !record.load_tid().absent() => record as *const Record,
                _ => return Status::WarnNotFound,
            }
        };
        self.write_set.push(WriteElement {
            key,
            record,
            new_body: body.to_vec(),
            op: OpType::Write,
        });
        Status::Ok
    }

    /// Register an insert. The record goes into the index immediately,
    /// marked absent until commit.
    pub fn insert(&mut self, key_bytes: &[u8], body: &[u8]) -> Status {
        let key = Key::from_bytes(key_bytes);
        if self.write_set.search(&key).is_some() {
            return Status::WarnAlreadyExists;
        }
        let mut lookup = key.clone();
        if self.tree.get(&mut lookup).is_some() {
            return Status::WarnAlreadyExists;
        }

        let record = Box::into_raw(Box::new(Record::new(body.to_vec())));
        let mut insert_key = key.clone();
        let status = self.tree.insert(&mut insert_key, record, &mut self.gc);
        if status == Status::WarnAlreadyExists {
            drop(unsafe { Box::from_raw(record) });
            return status;
        }
        self.write_set.push(WriteElement {
            key,
            record,
            new_body: body.to_vec(),
            op: OpType::Insert,
        });
        Status::Ok
    }

    /// Register a delete of an existing key; the absent bit is set at
    /// commit and the unlink is deferred to reclamation.
    pub fn delete(&mut self, key_bytes: &[u8]) -> Status {
        let key = Key::from_bytes(key_bytes);
        if self.write_set.search(&key).is_some() {
            // Deleting a key this transaction already wrote is rejected
            // rather than given merge semantics.
            return Status::WarnAlreadyExists;
        }
        let record = if let Some(read) = self.read_set.search(&key) {
            read.record
        } else {
            let mut lookup = key.clone();
            match self.tree.get(&mut lookup) {
                Some(record) if !record.load_tid().absent() => record as *const Record,
                _ => return Status::WarnNotFound,
            }
        };
        self.write_set.push(WriteElement {
            key,
            record,
            new_body: Vec::new(),
            op: OpType::Delete,
        });
        Status::Ok
    }

    /// Ordered range read. Every emitted record passes the read protocol
    /// and joins the read set, so scans validate like point reads.
    pub fn scan(
        &mut self,
        left_bytes: &[u8],
        l_exclusive: bool,
        right_bytes: &[u8],
        r_exclusive: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Status> {
        let left = Key::from_bytes(left_bytes);
        let right = Key::from_bytes(right_bytes);
        let raw_entries: Vec<(Key, *const Record)> = {
            let mut entries = Vec::new();
            let status = self
                .tree
                .scan(&left, l_exclusive, &right, r_exclusive, &mut entries);
            if !status.is_ok() {
                return Err(status);
            }
            entries
                .into_iter()
                .map(|(key, record)| (key, record as *const Record))
                .collect()
        };
        let mut out = Vec::with_capacity(raw_entries.len());
        for (key, record) in raw_entries {
            let key_bytes = key.to_bytes();
            // Pending writes of this transaction shadow the index.
            if let Some(write) = self.write_set.search(&key) {
                if write.op != OpType::Delete {
                    out.push((key_bytes, write.new_body.clone()));
                }
                continue;
            }
            if let Some(read) = self.read_set.search(&key) {
                out.push((key_bytes, read.body.clone()));
                continue;
            }
            match self.read_record(key, record) {
                Ok(body) => out.push((key_bytes, body)),
                // Absent records are in-flight inserts or deletes; skip.
                Err(Status::WarnNotFound) => continue,
                Err(status) => return Err(status),
            }
        }
        Ok(out)
    }

    /// Undo a failed or rejected transaction: inserted records come back
    /// out of the index, everything else was never applied.
    pub fn abort(&mut self) {
        let mut inserted: Vec<(Key, *const Record)> = Vec::new();
        for write in self.write_set.drain() {
            if write.op == OpType::Insert {
                inserted.push((write.key, write.record));
            }
        }
        for (mut key, record) in inserted {
            self.tree.remove(&mut key, &mut self.gc);
            self.gc.add_record(record);
        }
        self.read_set.clear();
        self.status = TransactionStatus::Aborted;
        metrics::log_abort();
    }

    /// Validate and, if serializable, make the transaction durable and
    /// visible. Returns false when the transaction lost its races and was
    /// aborted (the caller retries from `begin`).
    pub fn commit(&mut self) -> bool {
        let timer = metrics::commit_timer();
        if !self.validation_phase() {
            self.abort();
            return false;
        }
        let (reads, writes) = (self.read_set.len(), self.write_set.len());
        self.write_phase();
        metrics::log_commit(reads, writes);
        timer.finish();
        true
    }

    /// Phase 1 + 2 of Silo validation: lock the write set in key order
    /// (no-wait), fence, refresh the local epoch, then confirm every read
    /// is still current.
    fn validation_phase(&mut self) -> bool {
        self.write_set.sort_by_key();
        if !self.lock_write_set() {
            return false;
        }

        fence(Ordering::SeqCst);
        self.epochs
            .store_local_epoch(self.worker_id, self.epochs.global_epoch());
        fence(Ordering::SeqCst);

        let mut max_rset = self.max_rset;
        let mut failure = None;
        for read in self.read_set.iter() {
            let check = unsafe { (*read.record).load_tid() };
            if read.observed.epoch() != check.epoch() || read.observed.tid() != check.tid() {
                failure = Some("read_changed");
                break;
            }
            if check.lock() && self.write_set.search(&read.key).is_none() {
                failure = Some("read_locked");
                break;
            }
            max_rset = max_rset.max(check);
        }
        if let Some(cause) = failure {
            metrics::log_validation_failure(cause);
            self.unlock_write_set();
            self.status = TransactionStatus::Aborted;
            return false;
        }
        self.max_rset = max_rset;

        self.status = TransactionStatus::Committed;
        true
    }

    /// Lock every non-INSERT write target. A record already locked (or
    /// gone absent) aborts immediately: no waiting inside validation.
    fn lock_write_set(&mut self) -> bool {
        let targets: Vec<(*const Record, OpType)> = self
            .write_set
            .iter()
            .map(|write| (write.record, write.op))
            .collect();
        let mut locked = 0;
        for (record, op) in targets {
            if op == OpType::Insert {
                continue;
            }
            loop {
                let expected = unsafe { (*record).load_tid() };
                let failure = if expected.lock() {
                    Some("write_locked")
                } else if expected.absent() {
                    // The record was deleted (or its insert undone) after
                    // we resolved the key.
                    Some("write_absent")
                } else {
                    None
                };
                if let Some(cause) = failure {
                    metrics::log_validation_failure(cause);
                    self.unlock_first_n(locked);
                    self.status = TransactionStatus::Aborted;
                    return false;
                }
                let desired = expected.with_lock(true);
                if unsafe { (*record).cas_tid(expected, desired) }.is_ok() {
                    self.max_wset = self.max_wset.max(expected);
                    break;
                }
            }
            locked += 1;
        }
        true
    }

    fn unlock_write_set(&mut self) {
        self.unlock_first_n(usize::MAX);
    }

    fn unlock_first_n(&mut self, n: usize) {
        let mut unlocked = 0;
        for write in self.write_set.iter() {
            if write.op == OpType::Insert {
                continue;
            }
            if unlocked >= n {
                break;
            }
            let current = unsafe { (*write.record).load_tid() };
            debug_assert!(current.lock());
            unsafe { (*write.record).store_tid(current.with_lock(false)) };
            unlocked += 1;
        }
    }

    /// Phase 3: pick the commit TID, log, apply, release.
    fn write_phase(&mut self) {
        // The TID must exceed everything read or written, exceed this
        // worker's previous choice, and sit in the current epoch.
        let tid_a = self.max_rset.max(self.max_wset).incremented();
        let tid_b = self.mrctid.incremented();
        let tid_c = TidWord::new().with_epoch(self.epochs.local_epoch(self.worker_id));
        let max_tid = tid_a
            .max(tid_b)
            .max(tid_c)
            .with_lock(false)
            .with_latest(true)
            .with_absent(false);
        self.mrctid = max_tid;

        self.write_ahead_log(max_tid);

        for write in self.write_set.drain() {
            match write.op {
                OpType::Write => unsafe {
                    (*write.record).set_body(write.new_body);
                    (*write.record).store_tid(max_tid);
                },
                OpType::Insert => unsafe {
                    // Clearing absent makes the record visible.
                    (*write.record).store_tid(max_tid);
                },
                OpType::Delete => {
                    unsafe { (*write.record).store_tid(max_tid.with_absent(true)) };
                    self.pending_removals.push_back(PendingRemoval {
                        epoch: max_tid.epoch(),
                        key: write.key,
                        record: write.record,
                    });
                },
            }
        }
        self.read_set.clear();
    }

    /// Push the write set into the log buffer pool; an epoch-opening commit
    /// also publishes the worker's new CTIDW.
    fn write_ahead_log(&mut self, tid: TidWord) {
        let old_ctid = self.epochs.ctidw(self.worker_id);
        let new_epoch_begins = old_ctid.epoch() != tid.epoch();
        let entries: Vec<LogEntry> = self
            .write_set
            .iter()
            .map(|write| LogEntry {
                op: write.op,
                key: String::from_utf8_lossy(&write.key.to_bytes()).into_owned(),
                val: String::from_utf8_lossy(&write.new_body).into_owned(),
            })
            .collect();
        self.nid.tid = tid;
        self.log_buffer_pool
            .push(tid, self.nid.clone(), &entries, new_epoch_begins);
        if new_epoch_begins {
            self.epochs.store_ctidw(self.worker_id, tid);
        }
    }

    /// Committed DELETEs whose epoch is far enough behind are unlinked from
    /// the index and their records garbage-listed.
    pub(crate) fn process_pending_removals(&mut self) {
        let global_epoch = self.epochs.global_epoch();
        while let Some(front) = self.pending_removals.front() {
            if front.epoch + GarbageCollector::RECLAIM_EPOCH_LAG > global_epoch {
                break;
            }
            let PendingRemoval {
                mut key, record, ..
            } = self.pending_removals.pop_front().expect("front checked");
            self.tree.remove(&mut key, &mut self.gc);
            self.gc.add_record(record);
        }
    }

    pub(crate) fn epochs(&self) -> &Arc<EpochState> {
        &self.epochs
    }

    pub(crate) fn quit_signal(&self) -> &ShutdownSignal {
        &self.quit
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.is_signaled()
    }

    pub(crate) fn epoch_timer(&mut self) -> &mut Instant {
        &mut self.epoch_timer_start
    }

    /// Flush and detach from the logging pipeline at shutdown.
    pub fn terminate(&mut self) {
        self.log_buffer_pool.terminate();
        self.process_pending_removals();
    }
}
