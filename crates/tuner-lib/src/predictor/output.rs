//! Prediction output formatting
//!
//! Turns combined strategy output into a [`PredictionOutcome`] with a
//! human-readable rationale, and explains low-confidence results.

use super::strategies::{Neighbor, ParamPair};
use crate::cost_model::CostRecommendation;
use crate::models::{
    AdaptiveChunkingParams, MatchQuality, PredictionOutcome, PredictionSource, StrategyKind,
    StreamingParams, WorkloadCluster,
};

/// Configuration for output formatting
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Confidence below which a rejection is blamed on missing history
    pub insufficient_history_confidence: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            insufficient_history_confidence: 0.5,
        }
    }
}

/// Everything a history-based prediction was derived from
pub struct PredictionDetails<'a> {
    pub params: ParamPair,
    pub confidence: f64,
    pub neighbors: &'a [Neighbor<'a>],
    pub supporting_samples: usize,
    pub strategies: Vec<StrategyKind>,
    pub cluster: Option<&'a WorkloadCluster>,
    pub streaming: Option<StreamingParams>,
    pub adaptive: Option<AdaptiveChunkingParams>,
}

/// Formats predictions into outcomes
#[derive(Debug, Clone, Default)]
pub struct OutputFormatter {
    config: OutputConfig,
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OutputConfig) -> Self {
        Self { config }
    }

    pub fn format(&self, details: PredictionDetails<'_>) -> PredictionOutcome {
        let mean_distance = if details.neighbors.is_empty() {
            f64::MAX
        } else {
            details.neighbors.iter().map(|n| n.distance).sum::<f64>()
                / details.neighbors.len() as f64
        };
        let match_quality = MatchQuality::from_distance(mean_distance);

        let strategies = details
            .strategies
            .iter()
            .map(|s| s.key())
            .collect::<Vec<_>>()
            .join("+");
        let mut rationale = format!(
            "{} workers, batch {} from {} similar runs ({} match, strategies: {})",
            details.params.worker_count,
            details.params.batch_size,
            details.neighbors.len(),
            match_quality.as_str(),
            strategies
        );
        if let Some(cluster) = details.cluster {
            rationale.push_str(&format!("; {} workload", cluster.label));
        }
        if details.adaptive.map(|a| a.enabled).unwrap_or(false) {
            rationale.push_str("; adaptive chunking recommended");
        }

        PredictionOutcome {
            worker_count: details.params.worker_count,
            batch_size: details.params.batch_size,
            confidence: details.confidence.clamp(0.0, 1.0),
            rationale,
            supporting_samples: details.supporting_samples,
            match_quality,
            streaming: details.streaming,
            adaptive: details.adaptive,
            source: PredictionSource::History,
            strategies_used: details.strategies,
        }
    }

    /// Outcome for parameters chosen by the analytical cost model
    pub fn from_cost_model(
        &self,
        recommendation: &CostRecommendation,
        adaptive: Option<AdaptiveChunkingParams>,
    ) -> PredictionOutcome {
        PredictionOutcome {
            worker_count: recommendation.worker_count.max(1),
            batch_size: recommendation.batch_size.max(1),
            confidence: 0.0,
            rationale: format!(
                "{} workers, batch {} from the hardware cost model (estimated speedup {:.2})",
                recommendation.worker_count, recommendation.batch_size, recommendation.estimate.speedup
            ),
            supporting_samples: 0,
            match_quality: MatchQuality::Distant,
            streaming: None,
            adaptive,
            source: PredictionSource::CostModel,
            strategies_used: Vec::new(),
        }
    }

    pub fn is_low_confidence(&self, outcome: &PredictionOutcome, threshold: f64) -> bool {
        outcome.confidence < threshold
    }

    /// Get the reason for low confidence (if applicable)
    pub fn low_confidence_reason(&self, outcome: &PredictionOutcome, threshold: f64) -> Option<String> {
        if !self.is_low_confidence(outcome, threshold) {
            None
        } else if outcome.confidence < self.config.insufficient_history_confidence {
            Some("Insufficient historical data for reliable prediction".to_string())
        } else if outcome.match_quality == MatchQuality::Distant {
            Some("No closely matching workloads in history".to_string())
        } else {
            Some("High variance among similar past executions".to_string())
        }
    }
}
