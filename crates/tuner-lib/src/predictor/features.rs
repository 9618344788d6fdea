//! Feature extraction for parameter prediction
//!
//! Turns a measured workload and the machine it runs on into a fixed
//! 12-dimensional vector. Magnitudes are log-scaled between fixed bounds,
//! counts are scaled linearly, and the start method uses a 3-point map.
//! Extraction never fails: missing topology falls back to conservative defaults.

use crate::models::{
    feature_index as fi, FeatureVector, HardwareTopology, MachineProfile, WorkloadProfile,
    FEATURE_COUNT,
};

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * MB;

/// Scaling bounds for each raw magnitude
const DATASET_RANGE: (f64, f64) = (1.0, 1e8);
const ITEM_TIME_RANGE: (f64, f64) = (1e-6, 10.0);
const CORE_RANGE: (f64, f64) = (1.0, 128.0);
const MEMORY_RANGE: (f64, f64) = (1.0 * GB, 1024.0 * GB);
const ITEM_SIZE_RANGE: (f64, f64) = (1.0, 1e8);
const VARIANCE_RANGE: (f64, f64) = (0.0, 2.0);
const CACHE_RANGE: (f64, f64) = (1.0 * MB, 256.0 * MB);
const NUMA_RANGE: (f64, f64) = (1.0, 8.0);
const BANDWIDTH_RANGE: (f64, f64) = (1.0, 500.0);

/// Log min/max scaling into [0, 1]
pub fn log_normalize(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() || min <= 0.0 || max <= min {
        return 0.0;
    }
    let v = value.clamp(min, max);
    ((v.log10() - min.log10()) / (max.log10() - min.log10())).clamp(0.0, 1.0)
}

/// Linear min/max scaling into [0, 1]
pub fn linear_normalize(value: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() || max <= min {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Normalized cache size feature, shared with fingerprint similarity
pub fn normalize_cache(l3_bytes: u64) -> f64 {
    log_normalize(l3_bytes as f64, CACHE_RANGE.0, CACHE_RANGE.1)
}

pub fn normalize_cores(cores: u32) -> f64 {
    linear_normalize(cores as f64, CORE_RANGE.0, CORE_RANGE.1)
}

pub fn normalize_numa_nodes(nodes: u32) -> f64 {
    linear_normalize(nodes as f64, NUMA_RANGE.0, NUMA_RANGE.1)
}

pub fn normalize_bandwidth(gbps: f64) -> f64 {
    log_normalize(gbps, BANDWIDTH_RANGE.0, BANDWIDTH_RANGE.1)
}

/// Extracts normalized features from workload and machine descriptors
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    defaults: HardwareTopology,
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            defaults: HardwareTopology::default(),
        }
    }

    /// Use a different fallback when topology is missing
    pub fn with_default_topology(defaults: HardwareTopology) -> Self {
        Self { defaults }
    }

    pub fn extract(&self, workload: &WorkloadProfile, machine: &MachineProfile) -> FeatureVector {
        let topology = machine.topology.as_ref().unwrap_or(&self.defaults);
        let complexity = workload.complexity_secs.unwrap_or(workload.per_item_secs);

        let mut values = [0.0; FEATURE_COUNT];
        values[fi::DATASET_SIZE] =
            log_normalize(workload.dataset_size as f64, DATASET_RANGE.0, DATASET_RANGE.1);
        values[fi::ITEM_TIME] =
            log_normalize(workload.per_item_secs, ITEM_TIME_RANGE.0, ITEM_TIME_RANGE.1);
        values[fi::CORE_COUNT] = normalize_cores(machine.physical_cores);
        values[fi::MEMORY_SIZE] =
            log_normalize(machine.memory_bytes as f64, MEMORY_RANGE.0, MEMORY_RANGE.1);
        values[fi::START_METHOD] = machine.start_method.category_code();
        values[fi::ITEM_SIZE] =
            log_normalize(workload.item_bytes as f64, ITEM_SIZE_RANGE.0, ITEM_SIZE_RANGE.1);
        values[fi::TIME_VARIANCE] = linear_normalize(
            workload.variance_coefficient,
            VARIANCE_RANGE.0,
            VARIANCE_RANGE.1,
        );
        values[fi::COMPLEXITY] = log_normalize(complexity, ITEM_TIME_RANGE.0, ITEM_TIME_RANGE.1);
        values[fi::CACHE_SIZE] = normalize_cache(topology.l3_cache_bytes);
        values[fi::NUMA_NODES] = normalize_numa_nodes(topology.numa_nodes);
        values[fi::BANDWIDTH] = normalize_bandwidth(topology.memory_bandwidth_gbps);
        values[fi::HAS_NUMA] = if topology.has_numa { 1.0 } else { 0.0 };

        FeatureVector::new(values)
    }
}
