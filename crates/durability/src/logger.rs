//! The logger thread: drains its queue, writes sealed log sets in epoch
//! order, maintains the epoch hash chain, and publishes its local durable
//! epoch.

use std::{
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        Seek,
        SeekFrom,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use anyhow::Context;
use byteorder::{
    ByteOrder,
    LittleEndian,
};
use common::{
    epoch::EpochState,
    sha256::Sha256,
};

use crate::{
    buffer::PublishedBuffer,
    metrics,
    notifier::{
        NidBuffer,
        Notifier,
    },
    queue::LogQueue,
    seal::seal,
    wire::PASSPHRASE_HASH,
};

pub fn log_file_path(log_dir: &Path, logger_id: usize) -> PathBuf {
    log_dir.join(format!("log{logger_id}.seal"))
}

/// Where a logger resumes its hash chain, produced by recovery.
#[derive(Clone, Debug)]
pub struct LoggerResume {
    /// Byte offset of the end of the last durable set; the file is
    /// truncated here before appending.
    pub truncate_offset: u64,
    /// Hash chaining value for the next epoch written.
    pub prev_epoch_hash: String,
}

impl Default for LoggerResume {
    fn default() -> Self {
        Self {
            truncate_offset: 0,
            prev_epoch_hash: PASSPHRASE_HASH.clone(),
        }
    }
}

pub struct Logger {
    id: usize,
    queue: Arc<LogQueue>,
    epochs: Arc<EpochState>,
    notifier: Arc<Notifier>,
    /// Workers whose buffers land on this logger's queue.
    bound_workers: Vec<usize>,
    nid_buffer: NidBuffer,
    log_path: PathBuf,
    resume: LoggerResume,

    // Epoch hash chain state.
    prev_epoch_hash: String,
    open_epoch: Option<u64>,
    epoch_hash_acc: String,

    byte_count: u64,
}

impl Logger {
    pub fn new(
        id: usize,
        queue: Arc<LogQueue>,
        epochs: Arc<EpochState>,
        notifier: Arc<Notifier>,
        bound_workers: Vec<usize>,
        log_dir: &Path,
        resume: LoggerResume,
    ) -> Self {
        Self {
            id,
            queue,
            epochs,
            notifier,
            bound_workers,
            nid_buffer: NidBuffer::new(),
            log_path: log_file_path(log_dir, id),
            prev_epoch_hash: resume.prev_epoch_hash.clone(),
            resume,
            open_epoch: None,
            epoch_hash_acc: String::new(),
            byte_count: 0,
        }
    }

    /// Thread body. Loops until the queue is terminated and drained.
    pub fn run(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.log_path)
            .with_context(|| format!("opening {}", self.log_path.display()))?;
        // Drop any non-durable tail left behind by a crash.
        file.set_len(self.resume.truncate_offset)?;
        file.seek(SeekFrom::End(0))?;
        tracing::info!(
            "Logger {} writing {} (resume offset {})",
            self.id,
            self.log_path.display(),
            self.resume.truncate_offset
        );

        loop {
            self.wait_deq();
            if self.queue.is_quitting() && self.queue.is_empty() {
                break;
            }
            self.logging(&mut file, false)?;
        }
        self.logging(&mut file, true)?;
        tracing::info!("Logger {} wrote {} bytes total", self.id, self.byte_count);
        Ok(())
    }

    /// Wait for queued work, publishing durable-epoch advances while idle
    /// so commit acks flow even without new log traffic.
    fn wait_deq(&mut self) {
        while !self.queue.wait_deq() {
            if let Some(min_epoch) = self.find_min_epoch() {
                self.advance_durable(min_epoch, false);
            }
        }
    }

    /// The largest epoch that has definitely stopped producing records for
    /// this logger: the minimum over bound workers' CTIDW epochs and the
    /// queue's smallest epoch.
    fn find_min_epoch(&self) -> Option<u64> {
        let mut min_epoch = u64::MAX;
        for &worker in &self.bound_workers {
            // Workers publish a synthetic CTIDW on every epoch refresh, so
            // zero only appears in the startup window.
            let ctid = self.epochs.ctidw(worker);
            if ctid.raw() > 0 {
                min_epoch = min_epoch.min(ctid.epoch());
            }
        }
        if min_epoch == u64::MAX || min_epoch == 0 {
            return None;
        }
        if let Some(queue_epoch) = self.queue.min_epoch() {
            min_epoch = min_epoch.min(queue_epoch);
        }
        Some(min_epoch)
    }

    fn logging(&mut self, file: &mut File, quit: bool) -> anyhow::Result<()> {
        if self.queue.is_empty() {
            if quit {
                self.notifier.make_durable(&mut self.nid_buffer, quit);
            }
            return Ok(());
        }
        let Some(min_epoch) = self.find_min_epoch() else {
            return Ok(());
        };

        let buffers = self.queue.deq();
        let count = buffers.len();
        for published in buffers {
            self.write_log_set(file, published)?;
        }
        file.sync_all().context("syncing log file")?;
        metrics::log_sets_written(count as u64);

        self.advance_durable(min_epoch, quit);
        Ok(())
    }

    /// Serialize one buffer as a sealed, length-prefixed log set and append
    /// it, folding it into the epoch hash chain.
    fn write_log_set(
        &mut self,
        file: &mut File,
        mut published: PublishedBuffer,
    ) -> anyhow::Result<()> {
        let epoch = published.buffer.min_epoch();
        if self.open_epoch != Some(epoch) {
            if self.open_epoch.is_some() && !self.epoch_hash_acc.is_empty() {
                self.prev_epoch_hash = Sha256::hash(self.epoch_hash_acc.as_bytes()).as_hex();
                self.epoch_hash_acc.clear();
            }
            self.open_epoch = Some(epoch);
        }

        let set = published.buffer.assemble(self.prev_epoch_hash.clone());
        let nids = published.buffer.take_nids();
        self.epoch_hash_acc.push_str(&set.concatenated_record_hashes());
        let own_hash = set.own_hash();

        let json = serde_json::to_vec(&set).context("serializing log set")?;
        let sealed = seal(&json);
        let mut frame = Vec::with_capacity(8 + sealed.len());
        let mut len_prefix = [0u8; 8];
        LittleEndian::write_u64(&mut len_prefix, sealed.len() as u64);
        frame.extend_from_slice(&len_prefix);
        frame.extend_from_slice(&sealed);
        file.write_all(&frame).context("appending log set")?;
        self.byte_count += frame.len() as u64;
        metrics::log_bytes_written(frame.len() as u64);

        self.notifier.record_set_hash(self.id, epoch, own_hash);
        self.nid_buffer.store(nids, epoch);
        published.recycle();
        Ok(())
    }

    /// Raise this logger's local durable epoch to `min_epoch - 1` and let
    /// the notifier release whatever became durable.
    fn advance_durable(&mut self, min_epoch: u64, quit: bool) {
        if !quit && (min_epoch == 0 || min_epoch == u64::MAX) {
            return;
        }
        let new_dl = min_epoch.saturating_sub(1);
        let old_dl = self.epochs.logger_durable_epoch(self.id);
        if quit || old_dl < new_dl {
            if old_dl < new_dl {
                self.epochs.store_logger_durable_epoch(self.id, new_dl);
            }
            self.notifier.make_durable(&mut self.nid_buffer, quit);
        }
    }
}
