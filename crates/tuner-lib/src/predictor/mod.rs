//! Auto-tuning prediction engine

pub mod features;

mod clustering;
mod confidence;
mod engine;
mod ensemble;
mod feature_selection;
mod k_tuner;
mod output;
mod strategies;

pub use clustering::{label_for, WorkloadClusterer};
pub use confidence::{prediction_accuracy, Calibrator, ConfidenceScorer};
pub use engine::{
    ClusterSummary, EngineStats, ExecutionReport, PredictionEngine, PredictionResult,
    UpdateSummary,
};
pub use ensemble::{normalized_error, EnsembleWeights};
pub use feature_selection::{all_features, pearson, FeatureSelector};
pub use features::FeatureExtractor;
pub use k_tuner::KTuner;
pub use output::{OutputConfig, OutputFormatter, PredictionDetails};
pub use strategies::{
    knn_average, linear_fit, nearest_neighbors, Neighbor, ParamPair, StrategyContext,
    MIN_LINEAR_SAMPLES,
};
