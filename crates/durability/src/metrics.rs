use std::time::Duration;

use metrics::{
    log_counter,
    log_distribution,
    log_gauge,
    register_sealkv_counter,
    register_sealkv_gauge,
    register_sealkv_histogram,
    StatusTimer,
    STATUS_LABEL,
};

register_sealkv_counter!(LOG_BUFFERS_PUBLISHED_TOTAL, "Log buffers published to logger queues");
register_sealkv_histogram!(
    LOG_BUFFER_RECORDS_TOTAL,
    "Records per published log buffer"
);
pub fn log_buffer_published(records: usize) {
    log_counter(&LOG_BUFFERS_PUBLISHED_TOTAL, 1);
    log_distribution(&LOG_BUFFER_RECORDS_TOTAL, records as f64);
}

register_sealkv_counter!(LOG_SETS_WRITTEN_TOTAL, "Sealed log sets written");
pub fn log_sets_written(count: u64) {
    log_counter(&LOG_SETS_WRITTEN_TOTAL, count);
}

register_sealkv_counter!(LOG_BYTES_WRITTEN_TOTAL, "Bytes appended to sealed log files");
pub fn log_bytes_written(bytes: u64) {
    log_counter(&LOG_BYTES_WRITTEN_TOTAL, bytes);
}

register_sealkv_gauge!(DURABLE_EPOCH, "The current global durable epoch");
pub fn log_durable_epoch(epoch: u64) {
    log_gauge(&DURABLE_EPOCH, epoch as f64);
}

register_sealkv_counter!(COMMITS_NOTIFIED_TOTAL, "Commit acknowledgements released");
register_sealkv_histogram!(
    COMMIT_NOTIFY_SECONDS,
    "Time from transaction start to durable acknowledgement"
);
pub fn log_commit_notified(latency: Duration) {
    log_counter(&COMMITS_NOTIFIED_TOTAL, 1);
    log_distribution(&COMMIT_NOTIFY_SECONDS, latency.as_secs_f64());
}

register_sealkv_histogram!(RECOVERY_SECONDS, "Recovery duration", &STATUS_LABEL);
pub fn recovery_timer() -> StatusTimer {
    StatusTimer::new(&RECOVERY_SECONDS)
}

register_sealkv_counter!(RECOVERY_RECORDS_REPLAYED_TOTAL, "Log records replayed at recovery");
pub fn log_recovery_replayed(count: u64) {
    log_counter(&RECOVERY_RECORDS_REPLAYED_TOTAL, count);
}
