//! Observability infrastructure for the tuner
//!
//! Provides:
//! - Prometheus metrics (prediction latency, accept/reject counts, history size, threshold)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_gauge, Gauge,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Histogram buckets for prediction latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TunerMetricsInner> = OnceLock::new();

struct TunerMetricsInner {
    prediction_latency_seconds: Histogram,
    predictions_accepted: IntCounter,
    predictions_rejected: IntCounter,
    predictions_insufficient: IntCounter,
    outcomes_recorded: IntCounter,
    persistence_errors: IntCounter,
    history_records: IntGauge,
    calibrated_threshold: Gauge,
    batch_resizes: IntCounter,
    records_pruned: IntCounter,
}

impl TunerMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "tuner_prediction_latency_seconds",
                "Time spent producing a parameter prediction",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            predictions_accepted: register_int_counter!(
                "tuner_predictions_accepted_total",
                "Predictions whose confidence met the calibrated threshold"
            )
            .expect("Failed to register predictions_accepted"),

            predictions_rejected: register_int_counter!(
                "tuner_predictions_rejected_total",
                "Predictions rejected for low confidence"
            )
            .expect("Failed to register predictions_rejected"),

            predictions_insufficient: register_int_counter!(
                "tuner_predictions_insufficient_total",
                "Prediction requests answered with insufficient data"
            )
            .expect("Failed to register predictions_insufficient"),

            outcomes_recorded: register_int_counter!(
                "tuner_outcomes_recorded_total",
                "Measured execution outcomes fed back to the engine"
            )
            .expect("Failed to register outcomes_recorded"),

            persistence_errors: register_int_counter!(
                "tuner_persistence_errors_total",
                "Failed writes to the state repository"
            )
            .expect("Failed to register persistence_errors"),

            history_records: register_int_gauge!(
                "tuner_history_records",
                "Number of execution records held in the history store"
            )
            .expect("Failed to register history_records"),

            calibrated_threshold: register_gauge!(
                "tuner_confidence_threshold",
                "Current calibrated confidence threshold"
            )
            .expect("Failed to register confidence_threshold"),

            batch_resizes: register_int_counter!(
                "tuner_batch_resizes_total",
                "Batch size changes applied by the adaptive chunk controller"
            )
            .expect("Failed to register batch_resizes"),

            records_pruned: register_int_counter!(
                "tuner_records_pruned_total",
                "History records removed by pruning"
            )
            .expect("Failed to register records_pruned"),
        }
    }
}

/// Handle to the global tuner metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Debug, Clone)]
pub struct TunerMetrics {
    _private: (),
}

impl Default for TunerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TunerMetricsInner {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn inc_predictions_accepted(&self) {
        self.inner().predictions_accepted.inc();
    }

    pub fn inc_predictions_rejected(&self) {
        self.inner().predictions_rejected.inc();
    }

    pub fn inc_predictions_insufficient(&self) {
        self.inner().predictions_insufficient.inc();
    }

    pub fn inc_outcomes_recorded(&self) {
        self.inner().outcomes_recorded.inc();
    }

    pub fn inc_persistence_errors(&self) {
        self.inner().persistence_errors.inc();
    }

    pub fn set_history_records(&self, count: usize) {
        self.inner().history_records.set(count as i64);
    }

    pub fn set_threshold(&self, threshold: f64) {
        self.inner().calibrated_threshold.set(threshold);
    }

    pub fn inc_batch_resizes(&self) {
        self.inner().batch_resizes.inc();
    }

    pub fn add_records_pruned(&self, count: usize) {
        self.inner().records_pruned.inc_by(count as u64);
    }
}

/// Install a JSON tracing subscriber filtered by `RUST_LOG` (default `info`)
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .try_init();
}

/// Structured logger for tuner events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    machine: String,
}

impl StructuredLogger {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
        }
    }

    pub fn log_prediction(
        &self,
        worker_count: u32,
        batch_size: u32,
        confidence: f64,
        threshold: f64,
        supporting_samples: usize,
        match_quality: &str,
    ) {
        info!(
            event = "prediction_generated",
            machine = %self.machine,
            worker_count = worker_count,
            batch_size = batch_size,
            confidence = confidence,
            threshold = threshold,
            supporting_samples = supporting_samples,
            match_quality = %match_quality,
            "Generated concurrency prediction"
        );
    }

    pub fn log_rejection(&self, confidence: f64, threshold: f64, reason: &str) {
        debug!(
            event = "prediction_rejected",
            machine = %self.machine,
            confidence = confidence,
            threshold = threshold,
            reason = %reason,
            "Prediction below confidence threshold"
        );
    }

    pub fn log_outcome(
        &self,
        worker_count: u32,
        batch_size: u32,
        speedup: f64,
        accuracy: Option<f64>,
        persisted: bool,
    ) {
        if persisted {
            info!(
                event = "outcome_recorded",
                machine = %self.machine,
                worker_count = worker_count,
                batch_size = batch_size,
                speedup = speedup,
                accuracy = ?accuracy,
                "Recorded execution outcome"
            );
        } else {
            warn!(
                event = "outcome_recorded",
                machine = %self.machine,
                worker_count = worker_count,
                batch_size = batch_size,
                speedup = speedup,
                accuracy = ?accuracy,
                persisted = false,
                "Recorded execution outcome in memory only"
            );
        }
    }

    pub fn log_calibration(&self, old_threshold: f64, new_threshold: f64, samples: usize) {
        info!(
            event = "threshold_calibrated",
            machine = %self.machine,
            old_threshold = old_threshold,
            new_threshold = new_threshold,
            samples = samples,
            "Confidence threshold recalibrated"
        );
    }

    pub fn log_pruning(&self, original: usize, removed: usize, clusters: usize, reclaimed: usize) {
        info!(
            event = "history_pruned",
            machine = %self.machine,
            original = original,
            removed = removed,
            clusters = clusters,
            reclaimed_bytes = reclaimed,
            "Pruned execution history"
        );
    }

    pub fn log_resize(&self, old_size: u32, new_size: u32, average_secs: f64, target_secs: f64) {
        debug!(
            event = "batch_resized",
            machine = %self.machine,
            old_size = old_size,
            new_size = new_size,
            average_secs = average_secs,
            target_secs = target_secs,
            "Adaptive batch size changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuner_metrics_creation() {
        let metrics = TunerMetrics::new();
        metrics.observe_prediction_latency(0.0001);
        metrics.inc_predictions_accepted();
        metrics.inc_predictions_rejected();
        metrics.set_history_records(42);
        metrics.set_threshold(0.7);
        metrics.add_records_pruned(3);

        // A second handle shares the registered metrics
        let again = TunerMetrics::new();
        again.inc_batch_resizes();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-machine");
        assert_eq!(logger.machine, "test-machine");
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        init_tracing();
        init_tracing();
    }
}
