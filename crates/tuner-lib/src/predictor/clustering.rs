//! Workload clustering
//!
//! Groups history records with k-means (k-means++ seeding) so a query can
//! fall back on the typical parameters of its workload type. Clusters are
//! recomputed wholesale when the history generation changes.

use crate::config::ClusteringConfig;
use crate::models::{
    feature_index as fi, FeatureVector, HistoryRecord, WorkloadCluster, WorkloadKind,
    FEATURE_COUNT,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Lazily recomputed k-means clustering of history records
#[derive(Debug, Clone, Default)]
pub struct WorkloadClusterer {
    config: ClusteringConfig,
    clusters: Vec<WorkloadCluster>,
    computed_for: Option<u64>,
}

impl WorkloadClusterer {
    pub fn new(config: ClusteringConfig) -> Self {
        Self {
            config,
            clusters: Vec::new(),
            computed_for: None,
        }
    }

    /// Recompute clusters if `generation` differs from the last computation
    pub fn ensure_current(&mut self, records: &[HistoryRecord], generation: u64) {
        if self.computed_for == Some(generation) {
            return;
        }
        self.computed_for = Some(generation);

        if records.len() < self.config.min_records {
            self.clusters.clear();
            return;
        }

        self.clusters = self.compute(records);
        debug!(
            records = records.len(),
            clusters = self.clusters.len(),
            "Workload clusters recomputed"
        );
    }

    pub fn clusters(&self) -> &[WorkloadCluster] {
        &self.clusters
    }

    pub fn is_active(&self) -> bool {
        !self.clusters.is_empty()
    }

    /// Cluster whose centroid is nearest to `features`
    pub fn find_best_cluster(&self, features: &FeatureVector) -> Option<&WorkloadCluster> {
        self.clusters.iter().min_by(|a, b| {
            a.centroid
                .distance(features)
                .total_cmp(&b.centroid.distance(features))
        })
    }

    fn cluster_count(&self, n: usize) -> usize {
        let k = ((n as f64 / 2.0).sqrt().round() as usize).max(2);
        k.min(self.config.max_clusters.max(1)).min(n)
    }

    fn compute(&self, records: &[HistoryRecord]) -> Vec<WorkloadCluster> {
        let points: Vec<&FeatureVector> = records.iter().map(|r| &r.features).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut centroids = kmeans_pp_init(&points, self.cluster_count(points.len()), &mut rng);
        let mut assignments = vec![usize::MAX; points.len()];

        for _ in 0..self.config.max_iterations.max(1) {
            let mut changed = false;
            for (i, point) in points.iter().enumerate() {
                let nearest = nearest_centroid(point, &centroids);
                if assignments[i] != nearest {
                    assignments[i] = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                let members: Vec<&FeatureVector> = points
                    .iter()
                    .zip(assignments.iter())
                    .filter(|(_, &a)| a == c)
                    .map(|(p, _)| *p)
                    .collect();
                // Empty clusters keep their previous centroid
                if !members.is_empty() {
                    *centroid = mean_vector(&members);
                }
            }
        }

        centroids
            .into_iter()
            .enumerate()
            .filter_map(|(c, centroid)| {
                let members: Vec<usize> = assignments
                    .iter()
                    .enumerate()
                    .filter(|(_, &a)| a == c)
                    .map(|(i, _)| i)
                    .collect();
                if members.is_empty() {
                    return None;
                }
                let mut workers: Vec<u32> = members.iter().map(|&i| records[i].worker_count).collect();
                let mut batches: Vec<u32> = members.iter().map(|&i| records[i].batch_size).collect();
                let mean_speedup =
                    members.iter().map(|&i| records[i].speedup).sum::<f64>() / members.len() as f64;
                Some(WorkloadCluster {
                    id: c,
                    label: label_for(&centroid),
                    centroid,
                    typical_worker_count: median(&mut workers),
                    typical_batch_size: median(&mut batches),
                    mean_speedup,
                    members,
                })
            })
            .collect()
    }
}

/// k-means++ seeding: each new centroid is drawn with probability ∝ squared
/// distance to the nearest chosen centroid. Stops early once every point
/// coincides with a centroid.
fn kmeans_pp_init(points: &[&FeatureVector], k: usize, rng: &mut StdRng) -> Vec<FeatureVector> {
    let mut centroids = Vec::with_capacity(k);
    if points.is_empty() || k == 0 {
        return centroids;
    }
    centroids.push(*points[rng.gen_range(0..points.len())]);

    while centroids.len() < k {
        let dists: Vec<f64> = points
            .iter()
            .map(|p| {
                centroids
                    .iter()
                    .map(|c| c.distance(p).powi(2))
                    .fold(f64::MAX, f64::min)
            })
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= f64::EPSILON {
            break;
        }

        let r = rng.gen::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = points.len() - 1;
        for (i, d) in dists.iter().enumerate() {
            cumulative += d;
            if cumulative >= r && *d > 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(*points[chosen]);
    }
    centroids
}

fn nearest_centroid(point: &FeatureVector, centroids: &[FeatureVector]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.distance(point).total_cmp(&b.distance(point)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn mean_vector(members: &[&FeatureVector]) -> FeatureVector {
    let mut sum = [0.0; FEATURE_COUNT];
    for m in members {
        for (s, v) in sum.iter_mut().zip(m.values().iter()) {
            *s += v;
        }
    }
    let n = members.len().max(1) as f64;
    FeatureVector::new(sum.map(|s| s / n))
}

fn median(values: &mut [u32]) -> u32 {
    if values.is_empty() {
        return 1;
    }
    values.sort_unstable();
    values[values.len() / 2].max(1)
}

/// Label a cluster from its centroid
pub fn label_for(centroid: &FeatureVector) -> WorkloadKind {
    let time = centroid.get(fi::ITEM_TIME);
    let size = centroid.get(fi::ITEM_SIZE);
    let variance = centroid.get(fi::TIME_VARIANCE);

    if time > 0.6 && size < 0.4 {
        WorkloadKind::ComputeBound
    } else if time < 0.4 && size > 0.6 {
        WorkloadKind::IoBound
    } else if variance > 0.5 {
        WorkloadKind::Heterogeneous
    } else {
        WorkloadKind::Mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(features: [f64; FEATURE_COUNT], workers: u32, batch: u32) -> HistoryRecord {
        HistoryRecord {
            features: FeatureVector::new(features),
            worker_count: workers,
            batch_size: batch,
            speedup: workers as f64 * 0.8,
            timestamp: 0,
            streaming: None,
            adaptive: None,
            fingerprint: None,
            trust_weight: 1.0,
        }
    }

    fn two_groups() -> Vec<HistoryRecord> {
        let mut records = Vec::new();
        for i in 0..15 {
            let mut f = [0.1; FEATURE_COUNT];
            f[fi::ITEM_TIME] = 0.9;
            f[fi::DATASET_SIZE] = 0.1 + i as f64 * 0.001;
            records.push(record(f, 8, 10));
        }
        for i in 0..15 {
            let mut f = [0.1; FEATURE_COUNT];
            f[fi::ITEM_TIME] = 0.1;
            f[fi::ITEM_SIZE] = 0.9;
            f[fi::DATASET_SIZE] = 0.8 + i as f64 * 0.001;
            records.push(record(f, 2, 500));
        }
        records
    }

    #[test]
    fn test_inactive_below_minimum() {
        let mut clusterer = WorkloadClusterer::new(ClusteringConfig::default());
        let records: Vec<HistoryRecord> = two_groups().into_iter().take(10).collect();
        clusterer.ensure_current(&records, 1);
        assert!(!clusterer.is_active());
        assert!(clusterer.find_best_cluster(&records[0].features).is_none());
    }

    #[test]
    fn test_separates_groups() {
        let mut clusterer = WorkloadClusterer::new(ClusteringConfig::default());
        let records = two_groups();
        clusterer.ensure_current(&records, 1);
        assert!(clusterer.is_active());

        let compute = clusterer.find_best_cluster(&records[0].features).unwrap();
        assert_eq!(compute.typical_worker_count, 8);
        assert_eq!(compute.typical_batch_size, 10);
        assert_eq!(compute.label, WorkloadKind::ComputeBound);

        let io = clusterer.find_best_cluster(&records[20].features).unwrap();
        assert_eq!(io.typical_worker_count, 2);
        assert_eq!(io.label, WorkloadKind::IoBound);

        let total_members: usize = clusterer.clusters().iter().map(|c| c.members.len()).sum();
        assert_eq!(total_members, records.len());
    }

    #[test]
    fn test_identical_points_form_one_cluster() {
        let mut clusterer = WorkloadClusterer::new(ClusteringConfig::default());
        let records: Vec<HistoryRecord> =
            (0..25).map(|_| record([0.3; FEATURE_COUNT], 4, 100)).collect();
        clusterer.ensure_current(&records, 7);
        assert_eq!(clusterer.clusters().len(), 1);
        assert_eq!(clusterer.clusters()[0].members.len(), 25);
    }

    #[test]
    fn test_recompute_only_on_new_generation() {
        let mut clusterer = WorkloadClusterer::new(ClusteringConfig::default());
        let records = two_groups();
        clusterer.ensure_current(&records, 1);
        let before = clusterer.clusters().to_vec();
        // Same generation with different data: cached clusters kept
        clusterer.ensure_current(&records[..5], 1);
        assert_eq!(clusterer.clusters(), before.as_slice());
        clusterer.ensure_current(&records[..5], 2);
        assert!(!clusterer.is_active());
    }

    #[test]
    fn test_labels() {
        let mut f = [0.2; FEATURE_COUNT];
        f[fi::TIME_VARIANCE] = 0.9;
        f[fi::ITEM_TIME] = 0.5;
        f[fi::ITEM_SIZE] = 0.5;
        assert_eq!(label_for(&FeatureVector::new(f)), WorkloadKind::Heterogeneous);
        f[fi::TIME_VARIANCE] = 0.1;
        assert_eq!(label_for(&FeatureVector::new(f)), WorkloadKind::Mixed);
    }
}
