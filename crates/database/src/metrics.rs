use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution,
    register_sealkv_counter,
    register_sealkv_histogram,
    StaticMetricLabel,
    StatusTimer,
    STATUS_LABEL,
};

register_sealkv_counter!(TRANSACTIONS_COMMITTED_TOTAL, "Committed transactions");
register_sealkv_histogram!(
    TRANSACTION_READ_SET_SIZE_TOTAL,
    "Read-set entries per committed transaction"
);
register_sealkv_histogram!(
    TRANSACTION_WRITE_SET_SIZE_TOTAL,
    "Write-set entries per committed transaction"
);
pub fn log_commit(reads: usize, writes: usize) {
    log_counter(&TRANSACTIONS_COMMITTED_TOTAL, 1);
    log_distribution(&TRANSACTION_READ_SET_SIZE_TOTAL, reads as f64);
    log_distribution(&TRANSACTION_WRITE_SET_SIZE_TOTAL, writes as f64);
}

register_sealkv_counter!(TRANSACTIONS_ABORTED_TOTAL, "Aborted transactions");
pub fn log_abort() {
    log_counter(&TRANSACTIONS_ABORTED_TOTAL, 1);
}

register_sealkv_counter!(
    VALIDATION_FAILURES_TOTAL,
    "Validation failures by cause",
    &["cause"]
);
pub fn log_validation_failure(cause: &'static str) {
    log_counter_with_labels(
        &VALIDATION_FAILURES_TOTAL,
        1,
        &[StaticMetricLabel::new("cause", cause)],
    );
}

register_sealkv_histogram!(
    TRANSACTION_COMMIT_SECONDS,
    "Validation plus write-phase latency",
    &STATUS_LABEL
);
pub fn commit_timer() -> StatusTimer {
    StatusTimer::new(&TRANSACTION_COMMIT_SECONDS)
}
