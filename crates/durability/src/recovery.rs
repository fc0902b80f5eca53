//! Recovery: rebuild the index from sealed logs, verifying the intra-set
//! and inter-epoch hash chains up to the persisted durable epoch.

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;
use byteorder::{
    ByteOrder,
    LittleEndian,
};
use common::{
    sha256::Sha256,
    Record,
    TidWord,
};
use errors::ErrorMetadata;
use indexing::{
    GarbageCollector,
    Key,
    Masstree,
};

use crate::{
    logger::{
        log_file_path,
        LoggerResume,
    },
    metrics,
    pepoch::PepochFile,
    seal::unseal,
    wire::{
        LogRecord,
        LogSet,
        OpType,
        PASSPHRASE_HASH,
    },
};

/// What recovery hands back to the server: the epoch to resume from and
/// per-logger chain state.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub durable_epoch: u64,
    pub logger_resume: Vec<LoggerResume>,
}

impl RecoveryOutcome {
    /// A fresh store with nothing on disk.
    pub fn fresh(logger_num: usize) -> Self {
        Self {
            durable_epoch: 0,
            logger_resume: (0..logger_num).map(|_| LoggerResume::default()).collect(),
        }
    }
}

/// One logger's sealed file, consumed set-by-set.
struct LogArchive {
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
    finished: bool,

    /// The next parsed set (with its end offset), not yet validated.
    buffered: Option<(LogSet, u64)>,
    /// Hash chaining value expected in the next epoch's headers.
    previous_epoch_hash: String,
    /// Whether any set has been validated yet (the first may carry an
    /// empty `prev_epoch_hash`).
    validated_any: bool,
    /// Own-hash of the last validated set.
    last_validated_hash: Option<String>,
    /// File offset just past the last validated set.
    validated_offset: u64,
    expected_tail_hash: String,
}

impl LogArchive {
    fn open(path: PathBuf, expected_tail_hash: String) -> anyhow::Result<Self> {
        let data = if path.exists() {
            fs::read(&path).with_context(|| format!("reading {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            data,
            offset: 0,
            finished: false,
            buffered: None,
            previous_epoch_hash: PASSPHRASE_HASH.clone(),
            validated_any: false,
            last_validated_hash: None,
            validated_offset: 0,
            expected_tail_hash,
        })
    }

    /// Parse the next length-prefixed sealed set. A torn or unparsable
    /// tail marks the archive finished; whether that hides real damage is
    /// decided by the tail-hash check once the durable range is replayed.
    fn fetch_next(&mut self) -> anyhow::Result<Option<(LogSet, u64)>> {
        if self.finished || self.offset >= self.data.len() {
            self.finished = true;
            return Ok(None);
        }
        if self.data.len() - self.offset < 8 {
            tracing::warn!("Torn length prefix at end of {}", self.path.display());
            self.finished = true;
            return Ok(None);
        }
        let len = LittleEndian::read_u64(&self.data[self.offset..self.offset + 8]) as usize;
        let body_start = self.offset + 8;
        if self.data.len() - body_start < len {
            tracing::warn!("Torn log set at end of {}", self.path.display());
            self.finished = true;
            return Ok(None);
        }
        let sealed = &self.data[body_start..body_start + len];
        let json = match unseal(sealed) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("Unsealing failed in {}: {err:#}", self.path.display());
                self.finished = true;
                return Ok(None);
            },
        };
        let set: LogSet = match serde_json::from_slice(&json) {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!("Unparsable log set in {}: {err}", self.path.display());
                self.finished = true;
                return Ok(None);
            },
        };
        if set.log_set.is_empty() || set.log_header.log_record_num != set.log_set.len() as u64 {
            anyhow::bail!(ErrorMetadata::integrity(
                "LogSetHeaderMismatch",
                format!("Header record count disagrees in {}", self.path.display()),
            ));
        }
        self.offset = body_start + len;
        let end_offset = self.offset as u64;
        Ok(Some((set, end_offset)))
    }

    /// Pull every set of epoch `epoch` (they are written in epoch order)
    /// into `batch`, verifying both hash chains.
    fn take_epoch(&mut self, epoch: u64, batch: &mut Vec<LogRecord>) -> anyhow::Result<()> {
        let mut epoch_acc = String::new();
        loop {
            if self.buffered.is_none() {
                self.buffered = self.fetch_next()?;
            }
            let Some((front, _)) = &self.buffered else {
                break;
            };
            if front.epoch() > epoch {
                break;
            }
            if front.epoch() < epoch {
                anyhow::bail!(ErrorMetadata::integrity(
                    "EpochOrderViolation",
                    format!(
                        "Log set for epoch {} after epoch {epoch} in {}",
                        front.epoch(),
                        self.path.display()
                    ),
                ));
            }
            let (set, end_offset) = self.buffered.take().expect("front checked above");
            self.verify_set(&set, &mut epoch_acc)?;
            self.validated_offset = end_offset;
            batch.extend(set.log_set);
        }
        if !epoch_acc.is_empty() {
            self.previous_epoch_hash = Sha256::hash(epoch_acc.as_bytes()).as_hex();
        }
        Ok(())
    }

    fn verify_set(&mut self, set: &LogSet, epoch_acc: &mut String) -> anyhow::Result<()> {
        // Inter-epoch chain: an empty hash is only legal on the very first
        // set; every set of an epoch chains off the previous epoch's
        // records.
        let header_hash = &set.log_header.prev_epoch_hash;
        let chain_ok = if header_hash.is_empty() {
            !self.validated_any && self.previous_epoch_hash == *PASSPHRASE_HASH
        } else {
            *header_hash == self.previous_epoch_hash
        };
        if !chain_ok {
            anyhow::bail!(ErrorMetadata::integrity(
                "EpochChainMismatch",
                format!(
                    "Epoch hash chain broken at epoch {} in {}",
                    set.epoch(),
                    self.path.display()
                ),
            ));
        }
        if !set.verify_ring() {
            anyhow::bail!(ErrorMetadata::integrity(
                "RecordChainMismatch",
                format!(
                    "Record hash chain broken at epoch {} in {}",
                    set.epoch(),
                    self.path.display()
                ),
            ));
        }
        epoch_acc.push_str(&set.concatenated_record_hashes());
        self.validated_any = true;
        self.last_validated_hash = Some(set.own_hash());
        Ok(())
    }

    /// The persisted tail hash must match the last durable set (or the
    /// passphrase hash for a logger that wrote nothing durable).
    fn check_tail_hash(&self) -> anyhow::Result<()> {
        let actual = self
            .last_validated_hash
            .clone()
            .unwrap_or_else(|| PASSPHRASE_HASH.clone());
        if actual != self.expected_tail_hash {
            anyhow::bail!(ErrorMetadata::integrity(
                "TailHashMismatch",
                format!(
                    "Last durable log set of {} does not match the pepoch file",
                    self.path.display()
                ),
            ));
        }
        Ok(())
    }
}

/// Replay sealed logs into `tree` up to the durable epoch recorded in the
/// pepoch file. Any verification failure aborts recovery before the
/// service opens.
pub fn perform_recovery(
    tree: &Masstree,
    log_dir: &Path,
    logger_num: usize,
) -> anyhow::Result<RecoveryOutcome> {
    let timer = metrics::recovery_timer();
    let pepoch = PepochFile::new(log_dir);
    if !pepoch.exists() {
        tracing::info!("No pepoch file; starting fresh");
        return Ok(RecoveryOutcome::fresh(logger_num));
    }
    let (durable_epoch, tail_hashes) = pepoch.read().context("reading pepoch file")?;
    anyhow::ensure!(
        tail_hashes.len() == logger_num,
        ErrorMetadata::integrity(
            "LoggerCountMismatch",
            format!(
                "Pepoch file records {} loggers but {logger_num} are configured",
                tail_hashes.len()
            ),
        )
    );
    tracing::info!("Recovering up to durable epoch {durable_epoch}");

    let mut archives = Vec::with_capacity(logger_num);
    for (logger_id, tail_hash) in tail_hashes.into_iter().enumerate() {
        archives.push(LogArchive::open(
            log_file_path(log_dir, logger_id),
            tail_hash,
        )?);
    }

    let mut gc = GarbageCollector::new();
    let mut replayed = 0u64;
    for epoch in 1..=durable_epoch {
        let mut batch: Vec<LogRecord> = Vec::new();
        for archive in &mut archives {
            archive.take_epoch(epoch, &mut batch)?;
        }
        // Stable sort keeps file order among equal tids; tids order commits.
        batch.sort_by_key(|record| record.tid);
        for record in &batch {
            replay_record(tree, record, &mut gc)?;
        }
        replayed += batch.len() as u64;
    }
    for archive in &archives {
        archive.check_tail_hash()?;
    }
    gc.reclaim_all();

    let logger_resume = archives
        .iter()
        .map(|archive| LoggerResume {
            truncate_offset: archive.validated_offset,
            prev_epoch_hash: archive.previous_epoch_hash.clone(),
        })
        .collect();

    metrics::log_recovery_replayed(replayed);
    timer.finish();
    tracing::info!("Recovery replayed {replayed} log records");
    Ok(RecoveryOutcome {
        durable_epoch,
        logger_resume,
    })
}

fn replay_record(
    tree: &Masstree,
    record: &LogRecord,
    gc: &mut GarbageCollector,
) -> anyhow::Result<()> {
    let mut key = Key::from_bytes(record.key.as_bytes());
    let tid = TidWord::from_raw(record.tid)
        .with_lock(false)
        .with_absent(false)
        .with_latest(true);
    match record.op_type {
        OpType::Insert => {
            let value = Box::into_raw(Box::new(Record::with_tid(
                record.val.clone().into_bytes(),
                tid,
            )));
            let status = tree.insert(&mut key, value, gc);
            if !status.is_ok() {
                drop(unsafe { Box::from_raw(value) });
                anyhow::bail!(ErrorMetadata::integrity(
                    "ReplayInsertConflict",
                    format!("Replayed INSERT of existing key {:?}", record.key),
                ));
            }
        },
        OpType::Write => {
            let Some(existing) = tree.get(&mut key) else {
                anyhow::bail!(ErrorMetadata::integrity(
                    "ReplayWriteMissing",
                    format!("Replayed WRITE of unknown key {:?}", record.key),
                ));
            };
            existing.set_body(record.val.clone().into_bytes());
            existing.store_tid(tid);
        },
        OpType::Delete => {
            let record_ptr = {
                let Some(existing) = tree.get(&mut key) else {
                    anyhow::bail!(ErrorMetadata::integrity(
                        "ReplayDeleteMissing",
                        format!("Replayed DELETE of unknown key {:?}", record.key),
                    ));
                };
                existing as *const Record
            };
            let mut remove_key = Key::from_bytes(record.key.as_bytes());
            if tree.remove(&mut remove_key, gc).is_ok() {
                gc.add_record(record_ptr);
            }
        },
    }
    Ok(())
}
