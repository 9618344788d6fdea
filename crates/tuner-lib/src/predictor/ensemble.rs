//! Weighted strategy ensemble
//!
//! Strategy weights start equal and drift toward the ceiling for accurate
//! strategies and toward the floor for inaccurate ones, through an
//! exponential moving average.

use super::strategies::ParamPair;
use crate::config::EnsembleConfig;
use crate::models::StrategyKind;
use std::collections::BTreeMap;
use tracing::debug;

/// Mean relative error of a prediction against ground truth, clamped to [0, 1]
pub fn normalized_error(predicted: ParamPair, actual: ParamPair) -> f64 {
    let relative = |p: u32, a: u32| (p as f64 - a as f64).abs() / (a.max(1) as f64);
    let error = (relative(predicted.worker_count, actual.worker_count)
        + relative(predicted.batch_size, actual.batch_size))
        / 2.0;
    error.clamp(0.0, 1.0)
}

/// Adaptive per-strategy weights
#[derive(Debug, Clone)]
pub struct EnsembleWeights {
    config: EnsembleConfig,
    weights: BTreeMap<StrategyKind, f64>,
}

impl EnsembleWeights {
    pub fn new(config: EnsembleConfig) -> Self {
        let weights = StrategyKind::ALL
            .iter()
            .map(|&kind| (kind, config.initial_weight))
            .collect();
        Self { config, weights }
    }

    /// Restore persisted weights; unknown keys and non-finite values are ignored
    pub fn from_persisted(config: EnsembleConfig, persisted: &BTreeMap<String, f64>) -> Self {
        let mut ensemble = Self::new(config);
        for (key, &value) in persisted {
            match StrategyKind::from_key(key) {
                Some(kind) if value.is_finite() => {
                    let clamped = value.clamp(ensemble.config.weight_floor, ensemble.config.weight_ceiling);
                    ensemble.weights.insert(kind, clamped);
                }
                _ => debug!(key = %key, "Ignoring persisted ensemble weight"),
            }
        }
        ensemble
    }

    pub fn to_persisted(&self) -> BTreeMap<String, f64> {
        self.weights
            .iter()
            .map(|(kind, w)| (kind.key().to_string(), *w))
            .collect()
    }

    pub fn weight(&self, kind: StrategyKind) -> f64 {
        self.weights
            .get(&kind)
            .copied()
            .unwrap_or(self.config.initial_weight)
    }

    /// Weighted average over the strategies that produced a value
    pub fn combine(&self, proposals: &[(StrategyKind, ParamPair)]) -> Option<ParamPair> {
        if proposals.is_empty() {
            return None;
        }
        let weighted_total: f64 = proposals.iter().map(|(kind, _)| self.weight(*kind)).sum();
        let uniform = weighted_total <= 0.0;
        let total = if uniform {
            proposals.len() as f64
        } else {
            weighted_total
        };

        let mut workers = 0.0;
        let mut batch = 0.0;
        for (kind, pair) in proposals {
            let w = if uniform { 1.0 } else { self.weight(*kind) };
            workers += w * pair.worker_count as f64;
            batch += w * pair.batch_size as f64;
        }
        Some(ParamPair::from_estimates(workers / total, batch / total))
    }

    /// Nudge one strategy's weight given its normalized error in [0, 1]
    pub fn update(&mut self, kind: StrategyKind, error: f64) {
        let error = if error.is_finite() { error.clamp(0.0, 1.0) } else { 1.0 };
        let floor = self.config.weight_floor;
        let ceiling = self.config.weight_ceiling;
        let target = ceiling - (ceiling - floor) * error;
        let rate = self.config.learning_rate.clamp(0.0, 1.0);

        let current = self.weight(kind);
        let updated = (current + rate * (target - current)).clamp(floor, ceiling);
        self.weights.insert(kind, updated);
    }
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self::new(EnsembleConfig::default())
    }
}
