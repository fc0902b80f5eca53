//! The epoch-grouped write-ahead log pipeline and its tamper-evident
//! recovery.
//!
//! Committed write sets flow worker-side buffers -> per-logger queues ->
//! sealed log files; loggers publish per-logger durable epochs, the
//! notifier folds them into the global durable epoch (persisted in the
//! pepoch file alongside each logger's last-log hash) and releases commit
//! acknowledgements gated on it. Recovery replays the sealed logs up to
//! the durable epoch, verifying the intra-set rings and inter-epoch hash
//! chains on the way.

pub mod buffer;
pub mod logger;
pub mod metrics;
pub mod notifier;
pub mod pepoch;
pub mod queue;
pub mod recovery;
pub mod seal;
pub mod wire;

#[cfg(test)]
mod tests;

pub use crate::{
    buffer::LogBufferPool,
    logger::{
        Logger,
        LoggerResume,
    },
    notifier::{
        NidBuffer,
        NotificationId,
        NotificationSink,
        Notifier,
    },
    queue::LogQueue,
    recovery::{
        perform_recovery,
        RecoveryOutcome,
    },
    wire::{
        LogEntry,
        OpType,
    },
};
