//! End-to-end tests for the buffer -> queue -> logger -> notifier -> file
//! pipeline and its recovery.

use std::{
    fs,
    path::Path,
    sync::Arc,
    thread,
    time::Duration,
};

use common::{
    epoch::EpochState,
    TidWord,
};
use indexing::{
    Key,
    Masstree,
};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::{
    buffer::LogBufferPool,
    logger::{
        Logger,
        LoggerResume,
    },
    notifier::{
        NotificationId,
        NotificationSink,
        Notifier,
    },
    queue::LogQueue,
    recovery::perform_recovery,
    wire::{
        LogEntry,
        OpType,
    },
};

/// Collects released acknowledgements instead of writing to sessions.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(String, u64)>>,
}

impl NotificationSink for RecordingSink {
    fn deliver_commit(&self, nid: &NotificationId) {
        self.delivered
            .lock()
            .push((nid.session_id.clone(), nid.epoch()));
    }
}

struct TestPipeline {
    epochs: Arc<EpochState>,
    queue: Arc<LogQueue>,
    sink: Arc<RecordingSink>,
    pool: LogBufferPool,
    logger: Option<thread::JoinHandle<anyhow::Result<()>>>,
}

fn start_pipeline(log_dir: &Path) -> TestPipeline {
    start_pipeline_resuming(log_dir, LoggerResume::default(), 0)
}

/// One worker, one logger, optionally resuming a recovered hash chain and
/// durable epoch.
fn start_pipeline_resuming(
    log_dir: &Path,
    resume: LoggerResume,
    durable_epoch: u64,
) -> TestPipeline {
    let epochs = Arc::new(EpochState::new(1, 1));
    if durable_epoch > 0 {
        epochs.set_global_epoch(durable_epoch + 1);
        epochs.store_local_epoch(0, durable_epoch + 1);
        epochs.store_logger_durable_epoch(0, durable_epoch);
        epochs.try_advance_durable_epoch(durable_epoch);
    }
    let queue = Arc::new(LogQueue::new());
    let sink = Arc::new(RecordingSink::default());
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&epochs),
        log_dir,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
    ));
    let pool = LogBufferPool::new(Arc::clone(&queue));
    let mut logger = Logger::new(
        0,
        Arc::clone(&queue),
        Arc::clone(&epochs),
        Arc::clone(&notifier),
        vec![0],
        log_dir,
        resume,
    );
    let handle = thread::spawn(move || logger.run());
    TestPipeline {
        epochs,
        queue,
        sink,
        pool,
        logger: Some(handle),
    }
}

impl TestPipeline {
    /// Push one committed transaction at `epoch` with a single entry.
    fn commit(&mut self, epoch: u64, serial: u64, op: OpType, key: &str, val: &str) {
        let tid = TidWord::new().with_epoch(epoch).with_tid(serial);
        let old = self.epochs.ctidw(0);
        let new_epoch_begins = old.epoch() != tid.epoch();
        let mut nid = NotificationId::new(format!("sess{serial:02}"), serial);
        nid.tid = tid;
        self.pool.push(
            tid,
            nid,
            &[LogEntry {
                op,
                key: key.to_owned(),
                val: val.to_owned(),
            }],
            new_epoch_begins,
        );
        if new_epoch_begins {
            self.epochs.store_ctidw(0, tid);
        }
    }

    /// Tell the logger the worker has moved on to `epoch`.
    fn advance_worker(&mut self, epoch: u64) {
        self.pool.publish();
        self.epochs.store_ctidw(0, TidWord::epoch_marker(epoch));
    }

    fn shutdown(mut self) -> Vec<(String, u64)> {
        self.pool.terminate();
        self.queue.terminate();
        self.logger
            .take()
            .expect("logger running")
            .join()
            .unwrap()
            .unwrap();
        let delivered = self.sink.delivered.lock().clone();
        delivered
    }
}

fn wait_for_durable(epochs: &EpochState, target: u64) {
    for _ in 0..200 {
        if epochs.durable_epoch() >= target {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "durable epoch stuck at {} waiting for {target}",
        epochs.durable_epoch()
    );
}

#[test]
fn test_durable_epoch_gates_notifications() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = start_pipeline(dir.path());

    pipeline.commit(1, 0, OpType::Insert, "k", "v1");
    pipeline.commit(1, 1, OpType::Write, "k", "v2");
    // Nothing is durable while the worker may still emit epoch-1 records.
    thread::sleep(Duration::from_millis(30));
    assert_eq!(pipeline.epochs.durable_epoch(), 0);
    assert!(pipeline.sink.delivered.lock().is_empty());

    pipeline.advance_worker(2);
    wait_for_durable(&pipeline.epochs, 1);
    // Both epoch-1 commits are released once durable covers them.
    for _ in 0..200 {
        if pipeline.sink.delivered.lock().len() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let delivered = pipeline.sink.delivered.lock().clone();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|(_, epoch)| *epoch == 1));

    pipeline.shutdown();
}

#[test]
fn test_write_replay_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = start_pipeline(dir.path());

    pipeline.commit(1, 0, OpType::Insert, "alpha", "1");
    pipeline.commit(1, 1, OpType::Insert, "beta", "2");
    pipeline.advance_worker(2);
    pipeline.commit(2, 2, OpType::Write, "alpha", "updated");
    pipeline.commit(2, 3, OpType::Insert, "gamma", "3");
    pipeline.commit(2, 4, OpType::Delete, "beta", "");
    pipeline.advance_worker(3);
    wait_for_durable(&pipeline.epochs, 2);
    pipeline.shutdown();

    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 1).unwrap();
    assert_eq!(outcome.durable_epoch, 2);

    let lookup = |key: &str| {
        let mut key = Key::from_bytes(key.as_bytes());
        tree.get(&mut key).map(|record| record.read_body())
    };
    assert_eq!(lookup("alpha").unwrap(), b"updated");
    assert_eq!(lookup("gamma").unwrap(), b"3");
    assert_eq!(lookup("beta"), None);

    // The resume state chains off the recovered epochs.
    assert_eq!(outcome.logger_resume.len(), 1);
    assert!(outcome.logger_resume[0].truncate_offset > 0);
}

#[test]
fn test_recovery_ignores_non_durable_tail() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = start_pipeline(dir.path());

    pipeline.commit(1, 0, OpType::Insert, "durable-key", "v");
    pipeline.advance_worker(2);
    wait_for_durable(&pipeline.epochs, 1);
    // Epoch 2 is written at shutdown but never becomes durable.
    pipeline.commit(2, 1, OpType::Insert, "volatile-key", "v");
    pipeline.shutdown();

    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 1).unwrap();
    assert_eq!(outcome.durable_epoch, 1);
    let mut durable = Key::from_bytes(b"durable-key");
    assert!(tree.get(&mut durable).is_some());
    let mut volatile = Key::from_bytes(b"volatile-key");
    assert!(tree.get(&mut volatile).is_none());
}

#[test]
fn test_tampered_log_aborts_recovery() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = start_pipeline(dir.path());
    pipeline.commit(1, 0, OpType::Insert, "kk", "vv");
    pipeline.advance_worker(2);
    wait_for_durable(&pipeline.epochs, 1);
    pipeline.shutdown();

    let log_path = dir.path().join("log0.seal");
    let mut bytes = fs::read(&log_path).unwrap();
    // Flip one byte inside the sealed payload.
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x40;
    fs::write(&log_path, bytes).unwrap();

    let tree = Masstree::new();
    let err = perform_recovery(&tree, dir.path(), 1).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(
        rendered.contains("pepoch") || rendered.contains("durable"),
        "unexpected error: {rendered}"
    );
}

#[test]
fn test_restart_resumes_hash_chain() {
    let dir = TempDir::new().unwrap();

    // First run: one durable epoch.
    let mut pipeline = start_pipeline(dir.path());
    pipeline.commit(1, 0, OpType::Insert, "first-run", "a");
    pipeline.advance_worker(2);
    wait_for_durable(&pipeline.epochs, 1);
    pipeline.shutdown();

    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 1).unwrap();
    assert_eq!(outcome.durable_epoch, 1);

    // Second run continues the epoch chain from the recovered state.
    let resume = outcome.logger_resume[0].clone();
    let next_epoch = outcome.durable_epoch + 1;
    let mut pipeline = start_pipeline_resuming(dir.path(), resume, outcome.durable_epoch);
    pipeline.commit(next_epoch, 1, OpType::Insert, "second-run", "b");
    pipeline.advance_worker(next_epoch + 1);
    wait_for_durable(&pipeline.epochs, next_epoch);
    pipeline.shutdown();

    // Both runs' writes survive a second recovery intact.
    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 1).unwrap();
    assert_eq!(outcome.durable_epoch, next_epoch);
    for key in ["first-run", "second-run"] {
        let mut key = Key::from_bytes(key.as_bytes());
        assert!(tree.get(&mut key).is_some(), "missing after restart");
    }
}

#[test]
fn test_multi_logger_recovery_merges_by_tid() {
    let dir = TempDir::new().unwrap();
    let epochs = Arc::new(EpochState::new(2, 2));
    let sink = Arc::new(RecordingSink::default());
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&epochs),
        dir.path(),
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
    ));

    let queues: Vec<Arc<LogQueue>> = (0..2).map(|_| Arc::new(LogQueue::new())).collect();
    let mut pools: Vec<LogBufferPool> = queues
        .iter()
        .map(|queue| LogBufferPool::new(Arc::clone(queue)))
        .collect();
    let loggers: Vec<_> = (0..2)
        .map(|logger_id| {
            let mut logger = Logger::new(
                logger_id,
                Arc::clone(&queues[logger_id]),
                Arc::clone(&epochs),
                Arc::clone(&notifier),
                vec![logger_id],
                dir.path(),
                LoggerResume::default(),
            );
            thread::spawn(move || logger.run())
        })
        .collect();

    // Worker 0 inserts the key, worker 1 overwrites it in the next epoch;
    // tid order must survive the per-logger files.
    let tid_a = TidWord::new().with_epoch(1).with_tid(5);
    let mut nid = NotificationId::new("w0".to_owned(), 1);
    nid.tid = tid_a;
    pools[0].push(
        tid_a,
        nid,
        &[LogEntry {
            op: OpType::Insert,
            key: "shared".to_owned(),
            val: "old".to_owned(),
        }],
        true,
    );
    epochs.store_ctidw(0, tid_a);

    let tid_b = TidWord::new().with_epoch(2).with_tid(1);
    let mut nid = NotificationId::new("w1".to_owned(), 1);
    nid.tid = tid_b;
    pools[1].push(
        tid_b,
        nid,
        &[LogEntry {
            op: OpType::Write,
            key: "shared".to_owned(),
            val: "new".to_owned(),
        }],
        true,
    );
    epochs.store_ctidw(1, tid_b);

    for (worker, pool) in pools.iter_mut().enumerate() {
        pool.publish();
        epochs.store_ctidw(worker, TidWord::epoch_marker(3));
    }
    wait_for_durable(&epochs, 2);
    for pool in &mut pools {
        pool.terminate();
    }
    for queue in &queues {
        queue.terminate();
    }
    for logger in loggers {
        logger.join().unwrap().unwrap();
    }

    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 2).unwrap();
    assert_eq!(outcome.durable_epoch, 2);
    let mut key = Key::from_bytes(b"shared");
    assert_eq!(tree.get(&mut key).unwrap().read_body(), b"new");
}

#[test]
fn test_recovery_without_files_is_fresh() {
    let dir = TempDir::new().unwrap();
    let tree = Masstree::new();
    let outcome = perform_recovery(&tree, dir.path(), 2).unwrap();
    assert_eq!(outcome.durable_epoch, 0);
    assert_eq!(outcome.logger_resume.len(), 2);
    assert_eq!(outcome.logger_resume[0].truncate_offset, 0);
    assert!(tree.is_empty());
}
