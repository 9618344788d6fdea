//! Confidence scoring and threshold calibration
//!
//! Confidence blends neighbor proximity, history size and neighbor
//! agreement. The acceptance threshold is recalibrated from the accuracy
//! later observed for predictions at each confidence level.

use super::ensemble::normalized_error;
use super::strategies::{Neighbor, ParamPair};
use crate::config::CalibrationConfig;
use crate::models::{CalibrationSample, CalibrationState};

const PROXIMITY_WEIGHT: f64 = 0.5;
const SAMPLE_SIZE_WEIGHT: f64 = 0.2;
const CONSISTENCY_WEIGHT: f64 = 0.3;

/// History size at which the sample-size term saturates
const FULL_SAMPLE_COUNT: f64 = 20.0;

/// Samples above a candidate threshold needed for full support
const SUPPORT_COUNT: f64 = 10.0;

/// Spacing of the candidate threshold grid
const CANDIDATE_STEP: f64 = 0.05;

/// Accuracy of a prediction against ground truth, in [0, 1]
pub fn prediction_accuracy(predicted: ParamPair, actual: ParamPair) -> f64 {
    1.0 - normalized_error(predicted, actual)
}

/// Scores how much a prediction can be trusted
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    /// Confidence in [0, 1]
    ///
    /// # Arguments
    /// * `neighbors` - Records the prediction was derived from
    /// * `total_samples` - Size of the usable history
    /// * `feature_count` - Dimensions the neighbor distances were measured over
    pub fn score(&self, neighbors: &[Neighbor<'_>], total_samples: usize, feature_count: usize) -> f64 {
        if neighbors.is_empty() {
            return 0.0;
        }
        let n = neighbors.len() as f64;

        let mean_distance = neighbors.iter().map(|nb| nb.distance).sum::<f64>() / n;
        let max_distance = (feature_count.max(1) as f64).sqrt();
        let proximity = (1.0 - mean_distance / max_distance).clamp(0.0, 1.0);

        let sample_size = (total_samples as f64 / FULL_SAMPLE_COUNT).min(1.0);

        let workers: Vec<f64> = neighbors.iter().map(|nb| nb.record.worker_count as f64).collect();
        let consistency = (1.0 - coefficient_of_variation(&workers)).clamp(0.0, 1.0);

        (PROXIMITY_WEIGHT * proximity + SAMPLE_SIZE_WEIGHT * sample_size + CONSISTENCY_WEIGHT * consistency)
            .clamp(0.0, 1.0)
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 1.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// Self-tuning acceptance threshold
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    state: CalibrationState,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let state = CalibrationState::new(config.baseline_threshold);
        Self { config, state }
    }

    /// Resume from persisted state, keeping the threshold inside the configured bounds
    pub fn from_state(config: CalibrationConfig, mut state: CalibrationState) -> Self {
        if !state.adjusted_threshold.is_finite() {
            state.adjusted_threshold = config.baseline_threshold;
        }
        state.adjusted_threshold = state
            .adjusted_threshold
            .clamp(config.min_threshold, config.max_threshold);
        state
            .samples
            .retain(|s| s.confidence.is_finite() && s.accuracy.is_finite());
        let mut calibrator = Self { config, state };
        calibrator.trim();
        calibrator
    }

    pub fn threshold(&self) -> f64 {
        self.state.adjusted_threshold
    }

    pub fn is_usable(&self, confidence: f64) -> bool {
        confidence >= self.threshold()
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn sample_count(&self) -> usize {
        self.state.samples.len()
    }

    /// Track one (confidence, accuracy) observation and recalibrate
    ///
    /// Returns the new threshold when it moved.
    pub fn record(&mut self, confidence: f64, accuracy: f64, now: i64) -> Option<f64> {
        if !confidence.is_finite() || !accuracy.is_finite() {
            return None;
        }
        self.state.samples.push(CalibrationSample {
            confidence: confidence.clamp(0.0, 1.0),
            accuracy: accuracy.clamp(0.0, 1.0),
        });
        self.trim();

        if self.state.samples.len() < self.config.min_samples {
            return None;
        }
        let optimum = self.optimal_threshold()?;

        let current = self.state.adjusted_threshold;
        let updated = (current + self.config.step * (optimum - current))
            .clamp(self.config.min_threshold, self.config.max_threshold);
        if (updated - current).abs() < 1e-12 {
            return None;
        }
        self.state.adjusted_threshold = updated;
        self.state.last_updated = now;
        Some(updated)
    }

    fn trim(&mut self) {
        let excess = self.state.samples.len().saturating_sub(self.config.max_samples);
        if excess > 0 {
            self.state.samples.drain(..excess);
        }
    }

    /// Candidate maximizing mean accuracy above it, discounted by thin support.
    /// Ties go to the higher threshold; `None` when no candidate has support.
    fn optimal_threshold(&self) -> Option<f64> {
        let (min, max) = (self.config.min_threshold, self.config.max_threshold);
        let mut candidates: Vec<f64> = Vec::new();
        let mut t = min;
        while t <= max + 1e-9 {
            candidates.push(t.min(max));
            t += CANDIDATE_STEP;
        }
        candidates.extend(
            self.state
                .samples
                .iter()
                .map(|s| s.confidence)
                .filter(|c| (min..=max).contains(c)),
        );

        let mut best: Option<(f64, f64)> = None;
        for candidate in candidates {
            let above: Vec<f64> = self
                .state
                .samples
                .iter()
                .filter(|s| s.confidence >= candidate)
                .map(|s| s.accuracy)
                .collect();
            if above.is_empty() {
                continue;
            }
            let mean_accuracy = above.iter().sum::<f64>() / above.len() as f64;
            let score = mean_accuracy * (above.len() as f64 / SUPPORT_COUNT).min(1.0);

            best = match best {
                Some((best_score, best_t))
                    if best_score > score + 1e-12
                        || ((best_score - score).abs() <= 1e-12 && best_t >= candidate) =>
                {
                    Some((best_score, best_t))
                }
                _ => Some((score, candidate)),
            };
        }
        best.filter(|(score, _)| *score > 0.0).map(|(_, t)| t)
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}
