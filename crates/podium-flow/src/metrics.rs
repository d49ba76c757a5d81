//! Metrics for the score pipeline and worker fleet.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `podium_increments_total` | Counter | `result` | Compressed updates committed or failed |
//! | `podium_cas_conflicts_total` | Counter | - | Optimistic write conflicts (retried) |
//! | `podium_throttles_total` | Counter | `operation` | Backend throttling responses (retried) |
//! | `podium_malformed_inputs_total` | Counter | - | Input events rejected before the pipeline |
//! | `podium_admissions_total` | Counter | `decision` | Semaphore admission outcomes |
//! | `podium_workers_spawned_total` | Counter | - | Successful worker self-invocations |
//! | `podium_messages_acknowledged_total` | Counter | - | Queue messages deleted after processing |
//! | `podium_semaphore_tokens` | Gauge | `state` | Token count by state (`total`, `free`) |
//! | `podium_pipeline_batch_duration_seconds` | Histogram | - | Wall time of one pipeline run |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use podium_flow::metrics::PodiumMetrics;
//!
//! let metrics = PodiumMetrics::new();
//! metrics.record_increment("committed");
//! metrics.record_admission("granted");
//! metrics.set_token_counts(10, 3);
//! ```
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Compressed updates by result.
    pub const INCREMENTS_TOTAL: &str = "podium_increments_total";
    /// Counter: Optimistic write conflicts.
    pub const CAS_CONFLICTS_TOTAL: &str = "podium_cas_conflicts_total";
    /// Counter: Throttled backend calls.
    pub const THROTTLES_TOTAL: &str = "podium_throttles_total";
    /// Counter: Rejected input events.
    pub const MALFORMED_INPUTS_TOTAL: &str = "podium_malformed_inputs_total";
    /// Counter: Admission outcomes.
    pub const ADMISSIONS_TOTAL: &str = "podium_admissions_total";
    /// Counter: Worker self-invocations issued.
    pub const WORKERS_SPAWNED_TOTAL: &str = "podium_workers_spawned_total";
    /// Counter: Queue messages acknowledged.
    pub const MESSAGES_ACKNOWLEDGED_TOTAL: &str = "podium_messages_acknowledged_total";
    /// Gauge: Semaphore tokens by state.
    pub const SEMAPHORE_TOKENS: &str = "podium_semaphore_tokens";
    /// Histogram: Pipeline run duration in seconds.
    pub const PIPELINE_BATCH_DURATION_SECONDS: &str = "podium_pipeline_batch_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Increment result (committed, failed).
    pub const RESULT: &str = "result";
    /// Store operation that was throttled.
    pub const OPERATION: &str = "operation";
    /// Admission decision (granted, denied).
    pub const DECISION: &str = "decision";
    /// Token state (total, free).
    pub const STATE: &str = "state";
}

/// High-level interface for recording Podium metrics.
///
/// Stateless and cheap to clone; share one per component.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodiumMetrics;

impl PodiumMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records the result of one compressed update.
    pub fn record_increment(&self, result: &'static str) {
        counter!(names::INCREMENTS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records an optimistic write conflict.
    pub fn record_cas_conflict(&self) {
        counter!(names::CAS_CONFLICTS_TOTAL).increment(1);
    }

    /// Records a throttled backend call.
    pub fn record_throttle(&self, operation: &'static str) {
        counter!(names::THROTTLES_TOTAL, labels::OPERATION => operation).increment(1);
    }

    /// Records input events rejected before the pipeline.
    pub fn record_malformed(&self, count: u64) {
        counter!(names::MALFORMED_INPUTS_TOTAL).increment(count);
    }

    /// Records an admission decision.
    pub fn record_admission(&self, decision: &'static str) {
        counter!(names::ADMISSIONS_TOTAL, labels::DECISION => decision).increment(1);
    }

    /// Records worker self-invocations.
    pub fn record_workers_spawned(&self, count: u64) {
        counter!(names::WORKERS_SPAWNED_TOTAL).increment(count);
    }

    /// Records acknowledged queue messages.
    pub fn record_acknowledged(&self, count: u64) {
        counter!(names::MESSAGES_ACKNOWLEDGED_TOTAL).increment(count);
    }

    /// Sets the semaphore token gauges.
    #[allow(clippy::cast_precision_loss)] // Token counts are small
    pub fn set_token_counts(&self, total: usize, free: usize) {
        gauge!(names::SEMAPHORE_TOKENS, labels::STATE => "total").set(total as f64);
        gauge!(names::SEMAPHORE_TOKENS, labels::STATE => "free").set(free as f64);
    }

    /// Records the duration of a pipeline run.
    pub fn observe_pipeline_duration(&self, duration: Duration) {
        histogram!(names::PIPELINE_BATCH_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records a pipeline run.
#[must_use]
pub fn time_pipeline_run() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| PodiumMetrics::new().observe_pipeline_duration(duration))
}
