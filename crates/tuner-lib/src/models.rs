//! Core data models for the tuner

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of normalized features describing a workload on a machine
pub const FEATURE_COUNT: usize = 12;

/// Positions of each feature inside a [`FeatureVector`]
pub mod feature_index {
    pub const DATASET_SIZE: usize = 0;
    pub const ITEM_TIME: usize = 1;
    pub const CORE_COUNT: usize = 2;
    pub const MEMORY_SIZE: usize = 3;
    pub const START_METHOD: usize = 4;
    pub const ITEM_SIZE: usize = 5;
    pub const TIME_VARIANCE: usize = 6;
    pub const COMPLEXITY: usize = 7;
    pub const CACHE_SIZE: usize = 8;
    pub const NUMA_NODES: usize = 9;
    pub const BANDWIDTH: usize = 10;
    pub const HAS_NUMA: usize = 11;
}

/// Human-readable feature names, in vector order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "dataset_size",
    "item_time",
    "core_count",
    "memory_size",
    "start_method",
    "item_size",
    "time_variance",
    "complexity",
    "cache_size",
    "numa_nodes",
    "bandwidth",
    "has_numa",
];

/// Fixed-length normalized feature vector; every component lies in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; FEATURE_COUNT]", into = "[f64; FEATURE_COUNT]")]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl From<[f64; FEATURE_COUNT]> for FeatureVector {
    fn from(values: [f64; FEATURE_COUNT]) -> Self {
        Self::new(values)
    }
}

impl From<FeatureVector> for [f64; FEATURE_COUNT] {
    fn from(vector: FeatureVector) -> Self {
        vector.0
    }
}

impl FeatureVector {
    /// Build a vector, clamping every component into [0, 1] (non-finite values become 0)
    pub fn new(values: [f64; FEATURE_COUNT]) -> Self {
        let mut clamped = [0.0; FEATURE_COUNT];
        for (slot, value) in clamped.iter_mut().zip(values.iter()) {
            *slot = if value.is_finite() {
                value.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        Self(clamped)
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }

    pub fn get(&self, index: usize) -> f64 {
        self.0[index]
    }

    /// Euclidean distance over all 12 dimensions (max √12)
    pub fn distance(&self, other: &FeatureVector) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Euclidean distance restricted to the given feature indices
    pub fn distance_masked(&self, other: &FeatureVector, indices: &[usize]) -> f64 {
        indices
            .iter()
            .filter(|&&i| i < FEATURE_COUNT)
            .map(|&i| (self.0[i] - other.0[i]).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Worker startup strategy of the host pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartMethod {
    #[default]
    Fork,
    Forkserver,
    Spawn,
}

impl StartMethod {
    /// Category code used as a feature (3-point map)
    pub fn category_code(&self) -> f64 {
        match self {
            StartMethod::Fork => 0.0,
            StartMethod::Forkserver => 0.5,
            StartMethod::Spawn => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartMethod::Fork => "fork",
            StartMethod::Forkserver => "forkserver",
            StartMethod::Spawn => "spawn",
        }
    }
}

/// Cache, NUMA and bandwidth description of a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareTopology {
    pub l1_cache_bytes: u64,
    pub l2_cache_bytes: u64,
    pub l3_cache_bytes: u64,
    pub cache_line_bytes: u64,
    pub numa_nodes: u32,
    /// Cores sharing one NUMA node; 0 when unknown
    pub cores_per_node: u32,
    pub has_numa: bool,
    pub memory_bandwidth_gbps: f64,
}

impl Default for HardwareTopology {
    /// Conservative values used when detection is unavailable
    fn default() -> Self {
        Self {
            l1_cache_bytes: 32 * 1024,
            l2_cache_bytes: 256 * 1024,
            l3_cache_bytes: 8 * 1024 * 1024,
            cache_line_bytes: 64,
            numa_nodes: 1,
            cores_per_node: 0,
            has_numa: false,
            memory_bandwidth_gbps: 25.0,
        }
    }
}

/// Machine the workload runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineProfile {
    pub physical_cores: u32,
    pub memory_bytes: u64,
    pub start_method: StartMethod,
    pub topology: Option<HardwareTopology>,
}

impl MachineProfile {
    /// Detected topology or the conservative defaults
    pub fn topology_or_default(&self) -> HardwareTopology {
        self.topology.clone().unwrap_or_default()
    }
}

/// Measured characteristics of a batch workload, supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub dataset_size: u64,
    pub per_item_secs: f64,
    pub item_bytes: u64,
    pub result_bytes: u64,
    /// Coefficient of variation of per-item execution time
    pub variance_coefficient: f64,
    /// Complexity proxy in seconds; defaults to `per_item_secs`
    pub complexity_secs: Option<f64>,
}

/// Compact machine identity used for cross-machine comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFingerprint {
    pub hash: String,
    pub physical_cores: u32,
    pub l3_cache_bytes: u64,
    pub numa_nodes: u32,
    pub memory_bandwidth_gbps: f64,
    pub start_method: StartMethod,
}

/// Streaming parameters recorded with (or predicted for) an execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamingParams {
    pub buffer_depth: u32,
    pub ordered: bool,
}

/// Runtime batch-size adaptation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveChunkingParams {
    pub enabled: bool,
    pub adaptation_rate: f64,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
}

/// One completed execution: the features, the parameters used and the outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub features: FeatureVector,
    pub worker_count: u32,
    pub batch_size: u32,
    pub speedup: f64,
    pub timestamp: i64,
    pub streaming: Option<StreamingParams>,
    pub adaptive: Option<AdaptiveChunkingParams>,
    /// Machine the record originated on; `None` for records that predate fingerprints
    pub fingerprint: Option<SystemFingerprint>,
    pub trust_weight: f64,
}

/// Coarse workload type derived from a cluster centroid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    ComputeBound,
    IoBound,
    Heterogeneous,
    Mixed,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::ComputeBound => "compute-bound",
            WorkloadKind::IoBound => "I/O-bound",
            WorkloadKind::Heterogeneous => "heterogeneous",
            WorkloadKind::Mixed => "mixed",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group of similar history records
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadCluster {
    pub id: usize,
    pub centroid: FeatureVector,
    pub members: Vec<usize>,
    pub typical_worker_count: u32,
    pub typical_batch_size: u32,
    pub mean_speedup: f64,
    pub label: WorkloadKind,
}

/// A single (confidence, accuracy) observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub confidence: f64,
    pub accuracy: f64,
}

/// Tracked prediction accuracy and the self-tuned acceptance threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub samples: Vec<CalibrationSample>,
    pub adjusted_threshold: f64,
    pub baseline_threshold: f64,
    pub last_updated: i64,
}

impl CalibrationState {
    pub fn new(baseline_threshold: f64) -> Self {
        Self {
            samples: Vec::new(),
            adjusted_threshold: baseline_threshold,
            baseline_threshold,
            last_updated: 0,
        }
    }
}

/// Prediction strategies combined by the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyKind {
    Knn,
    Linear,
    ClusterLocal,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Knn,
        StrategyKind::Linear,
        StrategyKind::ClusterLocal,
    ];

    /// Key used when persisting ensemble weights
    pub fn key(&self) -> &'static str {
        match self {
            StrategyKind::Knn => "knn",
            StrategyKind::Linear => "linear",
            StrategyKind::ClusterLocal => "cluster",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "knn" => Some(StrategyKind::Knn),
            "linear" => Some(StrategyKind::Linear),
            "cluster" => Some(StrategyKind::ClusterLocal),
            _ => None,
        }
    }
}

/// How closely the query matched the supporting history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchQuality {
    Exact,
    Close,
    Partial,
    Distant,
}

impl MatchQuality {
    /// Classify a mean neighbor distance
    pub fn from_distance(mean_distance: f64) -> Self {
        if mean_distance < 0.05 {
            MatchQuality::Exact
        } else if mean_distance < 0.15 {
            MatchQuality::Close
        } else if mean_distance < 0.35 {
            MatchQuality::Partial
        } else {
            MatchQuality::Distant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchQuality::Exact => "exact",
            MatchQuality::Close => "close",
            MatchQuality::Partial => "partial",
            MatchQuality::Distant => "distant",
        }
    }
}

/// Where a prediction came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionSource {
    History,
    CostModel,
}

/// Suggested execution parameters; never persisted directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub worker_count: u32,
    pub batch_size: u32,
    pub confidence: f64,
    pub rationale: String,
    pub supporting_samples: usize,
    pub match_quality: MatchQuality,
    pub streaming: Option<StreamingParams>,
    pub adaptive: Option<AdaptiveChunkingParams>,
    pub source: PredictionSource,
    pub strategies_used: Vec<StrategyKind>,
}
