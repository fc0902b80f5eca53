use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

use crate::tid::TidWord;

/// Epoch bookkeeping shared by workers, loggers, and the notifier.
///
/// Invariants:
/// - `min_w(th_local_epoch[w]) >= global_epoch - 1`
/// - `durable_epoch <= global_epoch - 1`
/// - a commit at epoch `e` becomes client-visible only once
///   `durable_epoch >= e`.
pub struct EpochState {
    global_epoch: AtomicU64,
    durable_epoch: AtomicU64,
    th_local_epoch: Vec<AtomicU64>,
    ctidw: Vec<AtomicU64>,
    th_local_durable_epoch: Vec<AtomicU64>,
}

impl EpochState {
    pub fn new(worker_num: usize, logger_num: usize) -> Self {
        Self {
            global_epoch: AtomicU64::new(1),
            durable_epoch: AtomicU64::new(0),
            th_local_epoch: (0..worker_num).map(|_| AtomicU64::new(1)).collect(),
            ctidw: (0..worker_num).map(|_| AtomicU64::new(0)).collect(),
            th_local_durable_epoch: (0..logger_num).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn worker_num(&self) -> usize {
        self.th_local_epoch.len()
    }

    pub fn logger_num(&self) -> usize {
        self.th_local_durable_epoch.len()
    }

    pub fn global_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// CAS-advance the global epoch by one. Only the leader worker calls
    /// this, but recovery also uses the store below.
    pub fn advance_global_epoch(&self, observed: u64) -> bool {
        self.global_epoch
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Recovery sets the global epoch to `durable_epoch + 1` before the
    /// service opens; nothing else runs concurrently then.
    pub fn set_global_epoch(&self, epoch: u64) {
        self.global_epoch.store(epoch, Ordering::Release);
    }

    pub fn local_epoch(&self, worker: usize) -> u64 {
        self.th_local_epoch[worker].load(Ordering::Acquire)
    }

    pub fn store_local_epoch(&self, worker: usize, epoch: u64) {
        self.th_local_epoch[worker].store(epoch, Ordering::Release);
    }

    /// True iff every worker has observed the current global epoch; the
    /// precondition for advancing it.
    pub fn all_workers_observed(&self, epoch: u64) -> bool {
        self.th_local_epoch
            .iter()
            .all(|local| local.load(Ordering::Acquire) == epoch)
    }

    pub fn ctidw(&self, worker: usize) -> TidWord {
        TidWord::from_raw(self.ctidw[worker].load(Ordering::Acquire))
    }

    pub fn store_ctidw(&self, worker: usize, word: TidWord) {
        self.ctidw[worker].store(word.raw(), Ordering::Release);
    }

    pub fn durable_epoch(&self) -> u64 {
        self.durable_epoch.load(Ordering::Acquire)
    }

    /// CAS the durable epoch up to `epoch`. Returns whether this call won
    /// the update (and should persist the pepoch file).
    pub fn try_advance_durable_epoch(&self, epoch: u64) -> bool {
        let current = self.durable_epoch.load(Ordering::Acquire);
        if current >= epoch {
            return false;
        }
        self.durable_epoch
            .compare_exchange(current, epoch, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn logger_durable_epoch(&self, logger: usize) -> u64 {
        self.th_local_durable_epoch[logger].load(Ordering::Acquire)
    }

    pub fn store_logger_durable_epoch(&self, logger: usize, epoch: u64) {
        self.th_local_durable_epoch[logger].store(epoch, Ordering::Release);
    }

    /// The minimum local durable epoch across loggers: the candidate global
    /// durable epoch.
    pub fn min_logger_durable_epoch(&self) -> u64 {
        self.th_local_durable_epoch
            .iter()
            .map(|e| e.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::EpochState;
    use crate::tid::TidWord;

    #[test]
    fn test_advance_requires_observed_value() {
        let epochs = EpochState::new(2, 1);
        assert_eq!(epochs.global_epoch(), 1);
        assert!(!epochs.advance_global_epoch(7));
        assert!(epochs.advance_global_epoch(1));
        assert_eq!(epochs.global_epoch(), 2);
    }

    #[test]
    fn test_all_workers_observed() {
        let epochs = EpochState::new(2, 1);
        assert!(epochs.all_workers_observed(1));
        epochs.store_local_epoch(0, 2);
        assert!(!epochs.all_workers_observed(2));
        epochs.store_local_epoch(1, 2);
        assert!(epochs.all_workers_observed(2));
    }

    #[test]
    fn test_durable_epoch_is_monotonic() {
        let epochs = EpochState::new(1, 2);
        epochs.store_logger_durable_epoch(0, 5);
        epochs.store_logger_durable_epoch(1, 3);
        assert_eq!(epochs.min_logger_durable_epoch(), 3);
        assert!(epochs.try_advance_durable_epoch(3));
        assert!(!epochs.try_advance_durable_epoch(3));
        assert!(!epochs.try_advance_durable_epoch(2));
        assert_eq!(epochs.durable_epoch(), 3);
    }

    #[test]
    fn test_ctidw_round_trip() {
        let epochs = EpochState::new(1, 1);
        let word = TidWord::new().with_epoch(4).with_tid(9);
        epochs.store_ctidw(0, word);
        assert_eq!(epochs.ctidw(0), word);
    }
}
