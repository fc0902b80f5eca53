//! Tunable limits and parameters.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each should have a comment explaining what it is for so an oncall
//! engineer can adjust it safely.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// The epoch duration. The leader worker advances the global epoch once
/// every `EPOCH_TIME_MS` milliseconds, provided all workers have observed
/// the current epoch.
pub static EPOCH_TIME_MS: LazyLock<u64> = LazyLock::new(|| env_config("EPOCH_TIME_MS", 40));

/// [`EPOCH_TIME_MS`] as a `Duration`.
pub static EPOCH_DURATION: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(*EPOCH_TIME_MS));

/// The number of transaction worker threads.
pub static WORKER_NUM: LazyLock<usize> = LazyLock::new(|| env_config("WORKER_NUM", 4));

/// The number of logger threads. Should divide `WORKER_NUM`; worker `w` is
/// bound to logger `w % LOGGER_NUM`.
pub static LOGGER_NUM: LazyLock<usize> = LazyLock::new(|| env_config("LOGGER_NUM", 2));

/// Log buffers per worker pool, including the currently-open one. Must be at
/// least 2 so a worker can keep appending while one buffer is in flight.
pub static BUFFER_NUM: LazyLock<usize> = LazyLock::new(|| env_config("BUFFER_NUM", 2));

/// Log records buffered in one log buffer before it is published to the
/// logger queue even without an epoch boundary.
pub static MAX_BUFFERED_LOG_ENTRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_BUFFERED_LOG_ENTRIES", 1000));

/// Workers pause (doing epoch work only) while their local epoch is more
/// than `EPOCH_DIFF` ahead of the durable epoch. The steady-state pipeline
/// keeps the durable epoch one behind the global epoch, so values below 2
/// throttle all commit traffic.
pub static EPOCH_DIFF: LazyLock<u64> = LazyLock::new(|| env_config("EPOCH_DIFF", 2));

/// Directory holding the per-logger sealed log files and the pepoch file.
pub static LOG_DIR: LazyLock<String> = LazyLock::new(|| env_config("LOG_DIR", "log".to_owned()));

/// Path to the server certificate chain (PEM).
pub static TLS_CERT_PATH: LazyLock<String> =
    LazyLock::new(|| env_config("TLS_CERT_PATH", "certs/server.crt".to_owned()));

/// Path to the server private key (PEM).
pub static TLS_KEY_PATH: LazyLock<String> =
    LazyLock::new(|| env_config("TLS_KEY_PATH", "certs/server.key".to_owned()));

/// Path to the root certificate (PEM) that client certificates must chain
/// to; sessions are mutually authenticated.
pub static TLS_CA_PATH: LazyLock<String> =
    LazyLock::new(|| env_config("TLS_CA_PATH", "certs/ca.crt".to_owned()));
