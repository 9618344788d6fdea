//! Tuner configuration
//!
//! Every tunable constant of the engine lives here. Values load from
//! `TUNER__*` environment variables (e.g. `TUNER__CALIBRATION__BASELINE_THRESHOLD`)
//! and fall back to the defaults below.

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

/// Top-level tuner configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub cost_model: CostModelConfig,
    pub transfer: TransferConfig,
    pub clustering: ClusteringConfig,
    pub ensemble: EnsembleConfig,
    pub tuning: TuningConfig,
    pub calibration: CalibrationConfig,
    pub pruning: PruningConfig,
    pub chunking: ChunkingConfig,
}

impl TunerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TUNER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid tuner configuration, using defaults");
            TunerConfig::default()
        }))
    }
}

/// Heuristic constants of the analytical cost model
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostModelConfig {
    /// Per-worker cache coherency overhead rate
    pub coherency_rate: f64,
    pub coherency_exponent: f64,
    /// Upper bound of the cache pressure multiplier
    pub max_cache_pressure: f64,
    /// Coherency multiplier when workers span NUMA nodes
    pub numa_penalty: f64,
    /// Lowest allowed bandwidth factor
    pub bandwidth_floor: f64,
    pub false_sharing_rate: f64,
    /// Fixed serialization cost per item (seconds)
    pub serialization_overhead_secs: f64,
    /// Serialization throughput (bytes per second)
    pub serialization_bytes_per_sec: f64,
    /// Cost of dispatching one batch to a worker (seconds)
    pub dispatch_secs_per_batch: f64,
    pub fork_startup_secs: f64,
    pub forkserver_startup_secs: f64,
    pub spawn_startup_secs: f64,
    /// Minimum speedup per worker accepted by the analytical recommendation
    pub min_efficiency: f64,
    /// Batches per worker targeted by the analytical recommendation
    pub batches_per_worker: u32,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            coherency_rate: 0.03,
            coherency_exponent: 0.8,
            max_cache_pressure: 2.0,
            numa_penalty: 1.2,
            bandwidth_floor: 0.5,
            false_sharing_rate: 0.02,
            serialization_overhead_secs: 5e-6,
            serialization_bytes_per_sec: 500.0 * 1024.0 * 1024.0,
            dispatch_secs_per_batch: 100e-6,
            fork_startup_secs: 0.01,
            forkserver_startup_secs: 0.05,
            spawn_startup_secs: 0.15,
            min_efficiency: 0.6,
            batches_per_worker: 4,
        }
    }
}

/// Cross-machine history transfer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub min_similarity: f64,
    pub cross_weight: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.8,
            cross_weight: 0.7,
        }
    }
}

/// Workload clustering
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Records required before clustering activates
    pub min_records: usize,
    pub max_clusters: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_records: 20,
            max_clusters: 8,
            max_iterations: 50,
            seed: 42,
        }
    }
}

/// Strategy ensemble and online weight adaptation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Neighbors used when k has not been tuned
    pub default_k: usize,
    /// Records required before any prediction is attempted
    pub min_prediction_samples: usize,
    /// Records required before strategies other than k-NN vote
    pub min_ensemble_samples: usize,
    pub learning_rate: f64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    pub initial_weight: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            min_prediction_samples: 5,
            min_ensemble_samples: 10,
            learning_rate: 0.05,
            weight_floor: 0.1,
            weight_ceiling: 2.0,
            initial_weight: 1.0,
        }
    }
}

/// k search and feature selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub k_min: usize,
    pub k_max: usize,
    /// Records required before k is tuned
    pub min_samples: usize,
    /// Largest history evaluated with leave-one-out instead of k-fold
    pub loo_max_samples: usize,
    pub folds: usize,
    /// Relative growth of history that invalidates a cached choice
    pub regrowth_ratio: f64,
    pub selected_features: usize,
    /// Records required before feature selection
    pub selection_min_samples: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            k_min: 2,
            k_max: 15,
            min_samples: 30,
            loo_max_samples: 50,
            folds: 5,
            regrowth_ratio: 0.2,
            selected_features: 7,
            selection_min_samples: 30,
        }
    }
}

/// Confidence threshold calibration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub baseline_threshold: f64,
    /// Samples required before the threshold is recalibrated
    pub min_samples: usize,
    /// Fraction of the distance to the optimum moved per update
    pub step: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// Most recent samples retained
    pub max_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            baseline_threshold: 0.7,
            min_samples: 10,
            step: 0.1,
            min_threshold: 0.5,
            max_threshold: 0.95,
            max_samples: 500,
        }
    }
}

/// History pruning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Pruning is a no-op below this store size
    pub min_store_size: usize,
    /// Store size that triggers automatic pruning after an update
    pub auto_prune_size: usize,
    pub max_per_cluster: usize,
    pub min_per_cluster: usize,
    pub global_minimum: usize,
    /// Single-linkage radius as a fraction of the maximum distance √12
    pub similarity_radius: f64,
    /// Minimum distance between two kept records of one cluster
    pub min_kept_distance: f64,
    pub age_half_life_days: f64,
    pub base_weight: f64,
    pub age_weight: f64,
    pub performance_weight: f64,
    /// Estimated memory held by one record
    pub bytes_per_record: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            min_store_size: 50,
            auto_prune_size: 1000,
            max_per_cluster: 10,
            min_per_cluster: 2,
            global_minimum: 20,
            similarity_radius: 0.15,
            min_kept_distance: 0.02,
            age_half_life_days: 30.0,
            base_weight: 0.3,
            age_weight: 0.3,
            performance_weight: 0.4,
            bytes_per_record: 512,
        }
    }
}

/// Runtime batch-size adaptation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_batch_secs: f64,
    /// Relative band around the target inside which no resize happens
    pub tolerance: f64,
    pub window_size: usize,
    pub min_samples: usize,
    pub adaptation_rate: f64,
    /// Relative change required before a new size is applied
    pub min_change: f64,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
    /// Variance feature above which adaptive chunking is recommended
    pub variance_trigger: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_batch_secs: 0.2,
            tolerance: 0.2,
            window_size: 10,
            min_samples: 3,
            adaptation_rate: 0.5,
            min_change: 0.1,
            min_batch_size: 1,
            max_batch_size: 10_000,
            variance_trigger: 0.25,
        }
    }
}
