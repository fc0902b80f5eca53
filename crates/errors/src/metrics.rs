use metrics::{
    log_counter_with_labels,
    register_sealkv_counter,
    StaticMetricLabel,
};

use crate::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};

register_sealkv_counter!(
    ERRORS_REPORTED_TOTAL,
    "Number of errors reported, tagged with their short message",
    &["short_msg"]
);

/// Log an error to tracing and count it by classification. Unclassified
/// errors log at error level, classified ones at warn.
pub fn report_error(err: &anyhow::Error) {
    let short_msg = err.short_msg().unwrap_or("InternalError");
    log_counter_with_labels(
        &ERRORS_REPORTED_TOTAL,
        1,
        &[StaticMetricLabel::new("short_msg", short_msg.to_owned())],
    );
    match err.downcast_ref::<ErrorMetadata>() {
        Some(em) => tracing::warn!("{}: {}", em.short_msg, em.msg),
        None => tracing::error!("Unexpected error: {err:#}"),
    }
}
