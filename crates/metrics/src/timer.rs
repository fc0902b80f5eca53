use std::time::{
    Duration,
    Instant,
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::labels::StaticMetricLabel;

/// Records the elapsed wall-clock time into a histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// A [`Timer`] over a histogram with a `status` label. The timer starts in
/// the error state; call [`StatusTimer::finish`] on the success path.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    status: StaticMetricLabel,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            status: StaticMetricLabel::STATUS_ERROR,
        }
    }

    pub fn finish(mut self) -> Duration {
        self.status = StaticMetricLabel::STATUS_SUCCESS;
        self.start.elapsed()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.histogram
            .with_label_values(&[self.status.value()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        register_sealkv_histogram,
        StatusTimer,
        Timer,
    };

    register_sealkv_histogram!(TIMER_TEST_SECONDS, "Test histogram");
    register_sealkv_histogram!(
        STATUS_TIMER_TEST_SECONDS,
        "Test status histogram",
        &crate::STATUS_LABEL
    );

    #[test]
    fn test_timer_records_on_drop() {
        let before = TIMER_TEST_SECONDS.get_sample_count();
        drop(Timer::new(&TIMER_TEST_SECONDS));
        assert_eq!(TIMER_TEST_SECONDS.get_sample_count(), before + 1);
    }

    #[test]
    fn test_status_timer_labels() {
        let timer = StatusTimer::new(&STATUS_TIMER_TEST_SECONDS);
        timer.finish();
        assert_eq!(
            STATUS_TIMER_TEST_SECONDS
                .with_label_values(&["success"])
                .get_sample_count(),
            1
        );
        drop(StatusTimer::new(&STATUS_TIMER_TEST_SECONDS));
        assert_eq!(
            STATUS_TIMER_TEST_SECONDS
                .with_label_values(&["error"])
                .get_sample_count(),
            1
        );
    }
}
