//! Code for interacting with our metrics logging
use std::sync::LazyLock;

use prometheus::Registry;

mod labels;
mod macros;
mod reporting;
mod timer;

pub use paste::paste;
pub use prometheus;

pub use crate::{
    labels::{
        IntoLabel,
        StaticMetricLabel,
        STATUS_LABEL,
    },
    reporting::{
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};

/// Registry backing every metric declared through the `register_sealkv_*`
/// macros. Scraped (or dumped) as one unit.
pub static SEALKV_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Render every registered metric in the text exposition format. Handy for
/// debug endpoints and shutdown dumps.
pub fn dump_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    Ok(encoder.encode_to_string(&SEALKV_METRICS_REGISTRY.gather())?)
}
