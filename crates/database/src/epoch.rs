//! Epoch maintenance duties every worker performs between transactions:
//! leader-driven global-epoch advancement, local-epoch refresh with
//! synthetic CTIDW publication, and the durable-epoch pacing that keeps
//! workers from running unboundedly ahead of the loggers.

use std::hint;

use common::{
    knobs::{
        EPOCH_DIFF,
        EPOCH_DURATION,
    },
    TidWord,
};

use crate::transaction::TxExecutor;

/// Worker 0 is the epoch leader.
const LEADER_WORKER: usize = 0;

impl TxExecutor {
    /// Advance the global epoch once the epoch period elapsed and every
    /// worker has observed the current one.
    fn leader_work(&mut self) {
        if self.epoch_timer().elapsed() < *EPOCH_DURATION {
            return;
        }
        let epochs = self.epochs().clone();
        let global_epoch = epochs.global_epoch();
        if epochs.all_workers_observed(global_epoch) && epochs.advance_global_epoch(global_epoch)
        {
            *self.epoch_timer() = std::time::Instant::now();
            tracing::trace!("Global epoch advanced to {}", global_epoch + 1);
        }
    }

    /// Refresh this worker's view of the global epoch. On a change,
    /// publish a synthetic CTIDW so loggers observe the advance even
    /// without committed work.
    pub(crate) fn epoch_work(&mut self) {
        for _ in 0..200 {
            hint::spin_loop();
        }
        if self.worker_id() == LEADER_WORKER {
            self.leader_work();
        }
        let epochs = self.epochs().clone();
        let worker = self.worker_id();
        let old_ctid = epochs.ctidw(worker);
        let global_epoch = epochs.global_epoch();
        epochs.store_local_epoch(worker, global_epoch);
        if old_ctid.epoch() != global_epoch {
            epochs.store_ctidw(worker, TidWord::epoch_marker(global_epoch));
        }
    }

    /// The epoch-advancement service run between transactions: epoch work,
    /// buffer publication on epoch boundaries, deferred reclamation, and
    /// the `EPOCH_DIFF` pause against the durable epoch.
    pub fn durable_epoch_work(&mut self) {
        let epochs = self.epochs().clone();
        let worker = self.worker_id();

        let old_local = epochs.local_epoch(worker);
        self.epoch_work();
        let new_local = epochs.local_epoch(worker);
        if old_local != new_local {
            // The open buffer must not straddle the boundary.
            if self.log_buffer_pool.has_buffered_content() {
                self.log_buffer_pool.publish();
            }
            self.gc.set_epoch(new_local);
            self.process_pending_removals();
            self.gc.reclaim(epochs.global_epoch());
        }

        let quit = self.quit_signal().clone();
        while !quit.is_signaled()
            && epochs.local_epoch(worker) > epochs.durable_epoch() + *EPOCH_DIFF
        {
            self.epoch_work();
        }

        while !self.log_buffer_pool.is_ready() {
            self.epoch_work();
            if quit.is_signaled() {
                return;
            }
        }
    }
}
