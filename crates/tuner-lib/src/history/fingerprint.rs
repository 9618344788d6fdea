//! Machine fingerprints and cross-machine similarity

use crate::models::{HardwareTopology, StartMethod, SystemFingerprint};
use crate::predictor::features::{
    normalize_bandwidth, normalize_cache, normalize_cores, normalize_numa_nodes,
};
use sha2::{Digest, Sha256};

/// Similarity weights: cores, cache, NUMA nodes, bandwidth, start method
const WEIGHTS: [f64; 5] = [2.0, 1.5, 1.5, 1.0, 1.0];

impl SystemFingerprint {
    pub fn new(physical_cores: u32, topology: &HardwareTopology, start_method: StartMethod) -> Self {
        let canonical = format!(
            "cores={};l3={};numa={};bw={:.1};start={}",
            physical_cores,
            topology.l3_cache_bytes,
            topology.numa_nodes,
            topology.memory_bandwidth_gbps,
            start_method.as_str()
        );
        let digest = Sha256::digest(canonical.as_bytes());
        Self {
            hash: hex::encode(&digest[..8]),
            physical_cores,
            l3_cache_bytes: topology.l3_cache_bytes,
            numa_nodes: topology.numa_nodes,
            memory_bandwidth_gbps: topology.memory_bandwidth_gbps,
            start_method,
        }
    }

    fn normalized(&self) -> [f64; 5] {
        [
            normalize_cores(self.physical_cores),
            normalize_cache(self.l3_cache_bytes),
            normalize_numa_nodes(self.numa_nodes),
            normalize_bandwidth(self.memory_bandwidth_gbps),
            self.start_method.category_code(),
        ]
    }

    /// Similarity in [0, 1]; symmetric, and 1.0 for identical fingerprints
    pub fn similarity(&self, other: &SystemFingerprint) -> f64 {
        if self.hash == other.hash {
            return 1.0;
        }
        let a = self.normalized();
        let b = other.normalized();
        let weighted_sq: f64 = WEIGHTS
            .iter()
            .zip(a.iter().zip(b.iter()))
            .map(|(w, (x, y))| w * (x - y).powi(2))
            .sum();
        let max_distance = WEIGHTS.iter().sum::<f64>().sqrt();
        (1.0 - weighted_sq.sqrt() / max_distance).max(0.0)
    }
}
