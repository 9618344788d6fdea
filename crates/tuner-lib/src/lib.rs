//! Concurrency parameter auto-tuner
//!
//! This crate provides the core functionality for:
//! - Feature extraction from workload and machine descriptors
//! - An analytical hardware cost model
//! - History-driven prediction with an adaptive strategy ensemble
//! - Confidence scoring with a self-calibrating threshold
//! - Cross-machine history transfer and pruning
//! - Runtime batch-size adaptation

pub mod chunking;
pub mod config;
pub mod cost_model;
pub mod history;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod predictor;

pub use chunking::{AdaptiveChunkController, ChunkRunner, ChunkStats, RunSummary};
pub use config::TunerConfig;
pub use cost_model::{CostEstimate, CostRecommendation, HardwareCostModel};
pub use models::*;
pub use observability::{init_tracing, StructuredLogger, TunerMetrics};
pub use persistence::{FileRepository, MemoryRepository, RepositoryError, StateRepository};
pub use predictor::{
    ExecutionReport, FeatureExtractor, PredictionEngine, PredictionResult, UpdateSummary,
};
