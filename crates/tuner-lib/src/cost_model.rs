//! Analytical hardware cost model
//!
//! Estimates parallel execution time from worker startup, serialization,
//! batch dispatch and a compute term adjusted for cache coherency, false
//! sharing and memory bandwidth. Used when history is too thin to predict
//! from, and for diagnostics.

use crate::config::CostModelConfig;
use crate::models::{HardwareTopology, StartMethod, WorkloadProfile};
use serde::Serialize;

/// Per-component breakdown of an estimate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverheadBreakdown {
    pub startup_secs: f64,
    pub serialization_secs: f64,
    pub dispatch_secs: f64,
    pub compute_secs: f64,
    pub cache_factor: f64,
    pub cache_pressure: f64,
    pub numa_multiplier: f64,
    /// In [bandwidth_floor, 1.0]; divides compute time
    pub bandwidth_factor: f64,
    pub false_sharing_factor: f64,
}

impl OverheadBreakdown {
    fn baseline() -> Self {
        Self {
            startup_secs: 0.0,
            serialization_secs: 0.0,
            dispatch_secs: 0.0,
            compute_secs: 0.0,
            cache_factor: 1.0,
            cache_pressure: 1.0,
            numa_multiplier: 1.0,
            bandwidth_factor: 1.0,
            false_sharing_factor: 1.0,
        }
    }
}

/// Result of a cost estimate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub serial_secs: f64,
    pub parallel_secs: f64,
    pub speedup: f64,
    pub breakdown: OverheadBreakdown,
}

/// Parameters chosen by the analytical model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostRecommendation {
    pub worker_count: u32,
    pub batch_size: u32,
    pub estimate: CostEstimate,
}

/// Analytical speedup estimator
#[derive(Debug, Clone, Default)]
pub struct HardwareCostModel {
    config: CostModelConfig,
}

impl HardwareCostModel {
    pub fn new(config: CostModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CostModelConfig {
        &self.config
    }

    fn startup_secs(&self, method: StartMethod) -> f64 {
        match method {
            StartMethod::Fork => self.config.fork_startup_secs,
            StartMethod::Forkserver => self.config.forkserver_startup_secs,
            StartMethod::Spawn => self.config.spawn_startup_secs,
        }
    }

    /// Cache coherency factor; 1.0 for a single worker
    pub fn cache_factor(
        &self,
        worker_count: u32,
        batch_size: u32,
        workload: &WorkloadProfile,
        topology: &HardwareTopology,
    ) -> (f64, f64, f64) {
        if worker_count <= 1 {
            return (1.0, 1.0, 1.0);
        }

        let per_worker_set = batch_size.max(1) as f64
            * workload.item_bytes.saturating_add(workload.result_bytes) as f64;
        let aggregate = per_worker_set * worker_count as f64;
        let l3 = topology.l3_cache_bytes.max(1) as f64;
        let pressure = if aggregate <= l3 {
            1.0
        } else {
            (aggregate / l3).clamp(1.0, self.config.max_cache_pressure)
        };

        let numa_multiplier =
            if topology.cores_per_node > 0 && worker_count > topology.cores_per_node {
                self.config.numa_penalty
            } else {
                1.0
            };

        let factor = 1.0
            + self.config.coherency_rate
                * ((worker_count - 1) as f64).powf(self.config.coherency_exponent)
                * pressure
                * numa_multiplier;
        (factor, pressure, numa_multiplier)
    }

    /// Bandwidth factor in [bandwidth_floor, 1.0]
    pub fn bandwidth_factor(
        &self,
        worker_count: u32,
        workload: &WorkloadProfile,
        topology: &HardwareTopology,
    ) -> f64 {
        if workload.per_item_secs <= 0.0 || worker_count == 0 {
            return 1.0;
        }
        let bytes_per_item = workload.item_bytes.saturating_add(workload.result_bytes) as f64;
        let demanded_gbps =
            worker_count as f64 * bytes_per_item / workload.per_item_secs / 1e9;
        let available = topology.memory_bandwidth_gbps.max(f64::EPSILON);
        if demanded_gbps <= available {
            1.0
        } else {
            (available / demanded_gbps).clamp(self.config.bandwidth_floor, 1.0)
        }
    }

    /// False sharing factor; 1.0 when results fill a cache line or for one worker
    pub fn false_sharing_factor(
        &self,
        worker_count: u32,
        workload: &WorkloadProfile,
        topology: &HardwareTopology,
    ) -> f64 {
        if worker_count <= 1 || workload.result_bytes >= topology.cache_line_bytes {
            return 1.0;
        }
        1.0 + self.config.false_sharing_rate * ((worker_count - 1) as f64).sqrt()
    }

    /// Estimate speedup of running `workload` with the given parameters
    pub fn estimate(
        &self,
        worker_count: u32,
        batch_size: u32,
        workload: &WorkloadProfile,
        topology: &HardwareTopology,
        start_method: StartMethod,
    ) -> CostEstimate {
        let serial = workload.dataset_size as f64 * workload.per_item_secs;
        if worker_count == 0 || serial <= 0.0 || !serial.is_finite() {
            return CostEstimate {
                serial_secs: serial.max(0.0),
                parallel_secs: serial.max(0.0),
                speedup: 1.0,
                breakdown: OverheadBreakdown::baseline(),
            };
        }

        let items = workload.dataset_size as f64;
        let batch = batch_size.max(1) as f64;
        let batches = (items / batch).ceil();

        let startup_secs = self.startup_secs(start_method) * worker_count as f64;
        let per_item_serialization = self.config.serialization_overhead_secs
            + workload.item_bytes.saturating_add(workload.result_bytes) as f64
                / self.config.serialization_bytes_per_sec;
        let serialization_secs = per_item_serialization * items;
        let dispatch_secs = self.config.dispatch_secs_per_batch * batches;

        let (cache_factor, cache_pressure, numa_multiplier) =
            self.cache_factor(worker_count, batch_size, workload, topology);
        let bandwidth_factor = self.bandwidth_factor(worker_count, workload, topology);
        let false_sharing_factor = self.false_sharing_factor(worker_count, workload, topology);

        let compute_secs = serial / worker_count as f64 * cache_factor * false_sharing_factor
            / bandwidth_factor;
        let parallel = startup_secs + serialization_secs + dispatch_secs + compute_secs;
        let speedup = (serial / parallel).min(worker_count as f64);

        CostEstimate {
            serial_secs: serial,
            parallel_secs: parallel,
            speedup,
            breakdown: OverheadBreakdown {
                startup_secs,
                serialization_secs,
                dispatch_secs,
                compute_secs,
                cache_factor,
                cache_pressure,
                numa_multiplier,
                bandwidth_factor,
                false_sharing_factor,
            },
        }
    }

    /// Pick parameters analytically by scanning worker counts up to `max_workers`
    pub fn recommend(
        &self,
        workload: &WorkloadProfile,
        topology: &HardwareTopology,
        start_method: StartMethod,
        max_workers: u32,
    ) -> CostRecommendation {
        let max_workers = max_workers.max(1);
        let mut best: Option<CostRecommendation> = None;

        for workers in 1..=max_workers {
            let batch_size = self.batch_size_for(workload.dataset_size, workers);
            let estimate = self.estimate(workers, batch_size, workload, topology, start_method);
            let efficiency = estimate.speedup / workers as f64;
            if workers > 1 && efficiency < self.config.min_efficiency {
                continue;
            }
            let better = best
                .as_ref()
                .map(|b| estimate.speedup > b.estimate.speedup + 1e-9)
                .unwrap_or(true);
            if better {
                best = Some(CostRecommendation {
                    worker_count: workers,
                    batch_size,
                    estimate,
                });
            }
        }

        // workers == 1 always qualifies, so `best` is set
        best.unwrap_or_else(|| {
            let batch_size = self.batch_size_for(workload.dataset_size, 1);
            CostRecommendation {
                worker_count: 1,
                batch_size,
                estimate: self.estimate(1, batch_size, workload, topology, start_method),
            }
        })
    }

    fn batch_size_for(&self, dataset_size: u64, workers: u32) -> u32 {
        let chunks = workers as u64 * self.config.batches_per_worker.max(1) as u64;
        let size = dataset_size.div_ceil(chunks.max(1));
        size.clamp(1, u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload() -> WorkloadProfile {
        WorkloadProfile {
            dataset_size: 10_000,
            per_item_secs: 0.01,
            item_bytes: 1024,
            result_bytes: 8,
            variance_coefficient: 0.1,
            complexity_secs: None,
        }
    }

    fn numa_topology() -> HardwareTopology {
        HardwareTopology {
            numa_nodes: 2,
            cores_per_node: 8,
            has_numa: true,
            ..HardwareTopology::default()
        }
    }

    #[test]
    fn test_single_worker_baseline() {
        let model = HardwareCostModel::default();
        let est = model.estimate(1, 100, &workload(), &HardwareTopology::default(), StartMethod::Fork);
        assert_eq!(est.breakdown.cache_factor, 1.0);
        assert_eq!(est.breakdown.false_sharing_factor, 1.0);
        assert_eq!(est.breakdown.bandwidth_factor, 1.0);
        assert_eq!(est.breakdown.numa_multiplier, 1.0);
        assert!((0.9..=1.1).contains(&est.speedup), "speedup {}", est.speedup);
    }

    #[test]
    fn test_speedup_capped_at_worker_count() {
        let model = HardwareCostModel::default();
        for workers in 1..=64 {
            let est = model.estimate(workers, 50, &workload(), &numa_topology(), StartMethod::Fork);
            assert!(est.speedup <= workers as f64 + 1e-12);
        }
    }

    #[test]
    fn test_degenerate_inputs_return_unit_speedup() {
        let model = HardwareCostModel::default();
        let topo = HardwareTopology::default();
        assert_eq!(model.estimate(0, 10, &workload(), &topo, StartMethod::Fork).speedup, 1.0);
        let mut empty = workload();
        empty.per_item_secs = 0.0;
        assert_eq!(model.estimate(8, 10, &empty, &topo, StartMethod::Fork).speedup, 1.0);
    }

    #[test]
    fn test_extreme_item_sizes_stay_finite() {
        let model = HardwareCostModel::default();
        let mut huge = workload();
        huge.item_bytes = u64::MAX;
        huge.result_bytes = u64::MAX;
        let est = model.estimate(8, 100, &huge, &numa_topology(), StartMethod::Spawn);
        assert!(est.speedup.is_finite());
        assert!(est.speedup > 0.0);
        let rec = model.recommend(&huge, &numa_topology(), StartMethod::Spawn, 8);
        assert!((1..=8).contains(&rec.worker_count));
    }

    #[test]
    fn test_cache_factor_monotonic_in_workers() {
        let model = HardwareCostModel::default();
        let mut previous = 0.0;
        for workers in 1..=64 {
            let (factor, _, _) = model.cache_factor(workers, 500, &workload(), &numa_topology());
            assert!(factor >= 1.0);
            assert!(factor >= previous, "factor decreased at {} workers", workers);
            previous = factor;
        }
    }

    #[test]
    fn test_numa_multiplier_beyond_node() {
        let model = HardwareCostModel::default();
        let (_, _, within) = model.cache_factor(8, 10, &workload(), &numa_topology());
        let (_, _, beyond) = model.cache_factor(9, 10, &workload(), &numa_topology());
        assert_eq!(within, 1.0);
        assert_eq!(beyond, 1.2);
    }

    #[test]
    fn test_cache_pressure_ceiling() {
        let model = HardwareCostModel::default();
        let mut big = workload();
        big.item_bytes = 100 * 1024 * 1024;
        let (_, pressure, _) = model.cache_factor(16, 1000, &big, &HardwareTopology::default());
        assert_eq!(pressure, 2.0);
    }

    #[test]
    fn test_false_sharing_neutral_for_large_results() {
        let model = HardwareCostModel::default();
        let mut w = workload();
        w.result_bytes = 64;
        for workers in 1..=128 {
            assert_eq!(model.false_sharing_factor(workers, &w, &HardwareTopology::default()), 1.0);
        }
        w.result_bytes = 8;
        assert!(model.false_sharing_factor(4, &w, &HardwareTopology::default()) > 1.0);
    }

    #[test]
    fn test_bandwidth_factor_bounds() {
        let model = HardwareCostModel::default();
        let mut heavy = workload();
        heavy.item_bytes = 512 * 1024 * 1024;
        heavy.per_item_secs = 0.001;
        for workers in 1..=64 {
            let f = model.bandwidth_factor(workers, &heavy, &HardwareTopology::default());
            assert!((0.5..=1.0).contains(&f));
        }
        assert_eq!(model.bandwidth_factor(64, &heavy, &HardwareTopology::default()), 0.5);
    }

    #[test]
    fn test_recommend_parallelizes_compute_bound_work() {
        let model = HardwareCostModel::default();
        let rec = model.recommend(&workload(), &HardwareTopology::default(), StartMethod::Fork, 8);
        assert!(rec.worker_count > 1);
        assert!(rec.worker_count <= 8);
        assert!(rec.batch_size >= 1);
        assert!(rec.estimate.speedup / rec.worker_count as f64 >= 0.6);
    }

    #[test]
    fn test_recommend_keeps_tiny_work_serial() {
        let model = HardwareCostModel::default();
        let tiny = WorkloadProfile {
            dataset_size: 10,
            per_item_secs: 1e-6,
            item_bytes: 64,
            result_bytes: 64,
            variance_coefficient: 0.0,
            complexity_secs: None,
        };
        let rec = model.recommend(&tiny, &HardwareTopology::default(), StartMethod::Spawn, 16);
        assert_eq!(rec.worker_count, 1);
    }
}
