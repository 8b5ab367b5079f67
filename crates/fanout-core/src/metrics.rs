//! Metrics for the change-stream fan-out engine
//!
//! Emits through the `metrics` facade; nothing is recorded unless the
//! embedding process installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    pub const EVENTS_DISPATCHED_TOTAL: &str = "cdc_fanout_events_dispatched_total";
    pub const CHECKPOINTS_PERSISTED_TOTAL: &str = "cdc_fanout_checkpoints_persisted_total";
    pub const ERRORS_TOTAL: &str = "cdc_fanout_errors_total";
    pub const LISTENER_PANICS_TOTAL: &str = "cdc_fanout_listener_panics_total";
    pub const CURSOR_REOPENS_TOTAL: &str = "cdc_fanout_cursor_reopens_total";
    pub const POLL_DURATION: &str = "cdc_fanout_poll_duration_seconds";
    pub const LISTENERS: &str = "cdc_fanout_listeners";
}

/// Labels for metrics
pub mod labels {
    pub const COLLECTION: &str = "collection";
    pub const PARTITION: &str = "partition";
    pub const OPERATION: &str = "operation";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Per-partition worker metrics
#[derive(Debug, Clone)]
pub struct FanoutMetrics {
    collection: String,
    partition: String,
}

impl FanoutMetrics {
    pub fn new(collection: impl Into<String>, partition: u32) -> Self {
        Self {
            collection: collection.into(),
            partition: partition.to_string(),
        }
    }

    /// Record an event handed to the listeners
    pub fn record_dispatch(&self, operation: &str) {
        counter!(
            names::EVENTS_DISPATCHED_TOTAL,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Record a persisted resume token
    pub fn record_checkpoint(&self) {
        counter!(
            names::CHECKPOINTS_PERSISTED_TOTAL,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
        )
        .increment(1);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::ERRORS_TOTAL,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Record a listener that panicked during dispatch
    pub fn record_listener_panic(&self) {
        counter!(
            names::LISTENER_PANICS_TOTAL,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
        )
        .increment(1);
    }

    /// Record a cursor reopened after a failure
    pub fn record_cursor_reopen(&self) {
        counter!(
            names::CURSOR_REOPENS_TOTAL,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
        )
        .increment(1);
    }

    /// Record poll duration
    pub fn record_poll_duration(&self, duration: Duration) {
        histogram!(
            names::POLL_DURATION,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Set number of registered listeners
    pub fn set_listeners(&self, count: usize) {
        gauge!(
            names::LISTENERS,
            labels::COLLECTION => self.collection.clone(),
            labels::PARTITION => self.partition.clone(),
        )
        .set(count as f64);
    }
}

/// Records the duration of one cursor poll when dropped
///
/// Returned by [`FanoutMetrics::time_poll`]; `finish` records early and
/// hands back the measured duration.
pub struct PollTimer<'a> {
    metrics: &'a FanoutMetrics,
    started: Option<Instant>,
}

impl FanoutMetrics {
    pub fn time_poll(&self) -> PollTimer<'_> {
        PollTimer {
            metrics: self,
            started: Some(Instant::now()),
        }
    }
}

impl PollTimer<'_> {
    pub fn finish(mut self) -> Duration {
        self.record().unwrap_or_default()
    }

    fn record(&mut self) -> Option<Duration> {
        let elapsed = self.started.take()?.elapsed();
        self.metrics.record_poll_duration(elapsed);
        Some(elapsed)
    }
}

impl Drop for PollTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}
