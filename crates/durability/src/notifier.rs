//! Commit-acknowledgement release: tracks pending notification ids per
//! epoch, advances the global durable epoch, and persists the pepoch file.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
    time::Instant,
};

use common::{
    epoch::EpochState,
    TidWord,
};
use parking_lot::Mutex;

use crate::{
    metrics,
    pepoch::PepochFile,
    wire::PASSPHRASE_HASH,
};

/// Joins a committed transaction to its originating session so the ack can
/// be delivered once the commit is durable.
#[derive(Clone, Debug)]
pub struct NotificationId {
    pub session_id: String,
    /// In-session transaction counter.
    pub session_tx_id: u64,
    /// Commit TID; its epoch gates delivery.
    pub tid: TidWord,
    /// Key/value pairs observed by the transaction's reads, echoed in the
    /// ack.
    pub read_values: Vec<(String, String)>,
    pub tx_start: Instant,
}

impl NotificationId {
    pub fn new(session_id: String, session_tx_id: u64) -> Self {
        Self {
            session_id,
            session_tx_id,
            tid: TidWord::new(),
            read_values: Vec::new(),
            tx_start: Instant::now(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.tid.epoch()
    }
}

/// Where released notifications go: the session layer implements this and
/// writes the response frame (dropping it if the session is gone).
pub trait NotificationSink: Send + Sync {
    fn deliver_commit(&self, nid: &NotificationId);
}

/// Per-logger buffer of notification ids awaiting durability, bucketed by
/// commit epoch.
#[derive(Default)]
pub struct NidBuffer {
    buckets: BTreeMap<u64, Vec<NotificationId>>,
    len: usize,
}

impl NidBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, nids: Vec<NotificationId>, epoch: u64) {
        if nids.is_empty() {
            return;
        }
        self.len += nids.len();
        self.buckets.entry(epoch).or_default().extend(nids);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn min_epoch(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Deliver every notification with epoch <= `min_dl`.
    pub fn notify(&mut self, min_dl: u64, sink: &dyn NotificationSink) {
        let released: Vec<u64> = self
            .buckets
            .range(..=min_dl)
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in released {
            let nids = self.buckets.remove(&epoch).unwrap_or_default();
            self.len -= nids.len();
            for nid in nids {
                metrics::log_commit_notified(nid.tx_start.elapsed());
                sink.deliver_commit(&nid);
            }
        }
    }
}

/// Computes the global durable epoch as the minimum across loggers,
/// persists it (with each logger's last-log hash) to the pepoch file, and
/// releases pending acknowledgements.
pub struct Notifier {
    epochs: Arc<EpochState>,
    pepoch_file: PepochFile,
    sink: Arc<dyn NotificationSink>,
    /// Per logger: own-hash of each written set keyed by epoch, so the
    /// pepoch file can pin the last set at or below any durable epoch.
    set_hashes: Vec<Mutex<BTreeMap<u64, String>>>,
}

impl Notifier {
    pub fn new(
        epochs: Arc<EpochState>,
        log_dir: &Path,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let logger_num = epochs.logger_num();
        Self {
            epochs,
            pepoch_file: PepochFile::new(log_dir),
            sink,
            set_hashes: (0..logger_num).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    /// Called by logger `logger_id` after writing a set: remember its
    /// own-hash as the latest for that epoch.
    pub fn record_set_hash(&self, logger_id: usize, epoch: u64, own_hash: String) {
        self.set_hashes[logger_id].lock().insert(epoch, own_hash);
    }

    /// The hash the pepoch file should pin for a logger at durable epoch
    /// `durable`: its last written set at or below `durable`, or the
    /// passphrase hash if it has written nothing durable yet.
    fn last_log_hash(&self, logger_id: usize, durable: u64) -> String {
        let mut hashes = self.set_hashes[logger_id].lock();
        let selected = hashes
            .range(..=durable)
            .next_back()
            .map(|(epoch, hash)| (*epoch, hash.clone()));
        match selected {
            Some((epoch, hash)) => {
                // Older entries can never be selected again.
                *hashes = hashes.split_off(&epoch);
                hash
            },
            None => PASSPHRASE_HASH.clone(),
        }
    }

    /// Recompute the durable epoch; on advance, persist the pepoch file.
    /// Returns the current minimum across loggers.
    pub fn check_durable(&self) -> u64 {
        let min_dl = self.epochs.min_logger_durable_epoch();
        if self.epochs.try_advance_durable_epoch(min_dl) {
            let hashes: Vec<String> = (0..self.epochs.logger_num())
                .map(|logger_id| self.last_log_hash(logger_id, min_dl))
                .collect();
            if let Err(err) = self.pepoch_file.write(min_dl, &hashes) {
                // Losing the pepoch write means recovery would fall back to
                // an older durable epoch; surface loudly.
                tracing::error!("Failed to persist durable epoch {min_dl}: {err:#}");
            }
            metrics::log_durable_epoch(min_dl);
            tracing::debug!("Durable epoch advanced to {min_dl}");
        }
        min_dl
    }

    /// Release every notification whose epoch is durable; with `quit`, all
    /// of them.
    pub fn make_durable(&self, buffer: &mut NidBuffer, quit: bool) {
        let min_dl = self.check_durable();
        match buffer.min_epoch() {
            Some(min_epoch) if quit || min_epoch <= min_dl => {},
            _ => return,
        }
        let release_up_to = if quit { u64::MAX } else { min_dl };
        buffer.notify(release_up_to, &*self.sink);
    }
}
