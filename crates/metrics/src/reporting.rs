use prometheus::{
    Gauge,
    GaugeVec,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::labels::StaticMetricLabel;

fn label_values<'a>(labels: &'a [StaticMetricLabel]) -> Vec<&'a str> {
    labels.iter().map(|label| label.value()).collect()
}

pub fn log_counter(counter: &IntCounter, value: u64) {
    counter.inc_by(value);
}

pub fn log_counter_with_labels(counter: &IntCounterVec, value: u64, labels: &[StaticMetricLabel]) {
    counter.with_label_values(&label_values(labels)).inc_by(value);
}

pub fn log_distribution(histogram: &Histogram, value: f64) {
    histogram.observe(value);
}

pub fn log_distribution_with_labels(
    histogram: &HistogramVec,
    value: f64,
    labels: &[StaticMetricLabel],
) {
    histogram
        .with_label_values(&label_values(labels))
        .observe(value);
}

pub fn log_gauge(gauge: &Gauge, value: f64) {
    gauge.set(value);
}

pub fn log_gauge_with_labels(gauge: &GaugeVec, value: f64, labels: &[StaticMetricLabel]) {
    gauge.with_label_values(&label_values(labels)).set(value);
}
