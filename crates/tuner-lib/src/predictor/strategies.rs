//! Prediction strategies
//!
//! Each strategy independently proposes a (worker_count, batch_size) pair
//! for a query vector, or nothing when it lacks the data to do so.

use super::clustering::WorkloadClusterer;
use crate::models::{FeatureVector, HistoryRecord, StrategyKind, FEATURE_COUNT};
use ndarray::{Array1, Array2, Axis};

/// Offset keeping inverse-distance weights finite for exact matches
const DISTANCE_EPSILON: f64 = 1e-6;

/// Ridge penalty for the local linear fit
const RIDGE_LAMBDA: f64 = 1e-3;

/// Samples required before the linear strategy fits anything
pub const MIN_LINEAR_SAMPLES: usize = 3;

/// A proposed parameter pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamPair {
    pub worker_count: u32,
    pub batch_size: u32,
}

impl ParamPair {
    pub fn new(worker_count: u32, batch_size: u32) -> Self {
        Self {
            worker_count: worker_count.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Round raw estimates to valid parameters (at least 1)
    pub fn from_estimates(workers: f64, batch: f64) -> Self {
        Self::new(round_to_count(workers), round_to_count(batch))
    }
}

fn round_to_count(value: f64) -> u32 {
    if !value.is_finite() {
        return 1;
    }
    value.round().clamp(1.0, u32::MAX as f64) as u32
}

/// A history record together with its distance to the query
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub record: &'a HistoryRecord,
    pub distance: f64,
}

/// The `k` records nearest to `query` over the features in `mask`, closest first
pub fn nearest_neighbors<'a>(
    records: &'a [HistoryRecord],
    query: &FeatureVector,
    k: usize,
    mask: &[usize],
) -> Vec<Neighbor<'a>> {
    let mut neighbors: Vec<Neighbor<'a>> = records
        .iter()
        .map(|record| Neighbor {
            record,
            distance: query.distance_masked(&record.features, mask),
        })
        .collect();
    neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    neighbors.truncate(k);
    neighbors
}

/// Inverse-distance weighted average, scaled by each record's trust weight
pub fn knn_average(neighbors: &[Neighbor<'_>]) -> Option<ParamPair> {
    let mut total_weight = 0.0;
    let mut workers = 0.0;
    let mut batch = 0.0;
    for n in neighbors {
        let weight = n.record.trust_weight.max(0.0) / (n.distance + DISTANCE_EPSILON);
        total_weight += weight;
        workers += weight * n.record.worker_count as f64;
        batch += weight * n.record.batch_size as f64;
    }
    if total_weight <= 0.0 || !total_weight.is_finite() {
        return None;
    }
    Some(ParamPair::from_estimates(
        workers / total_weight,
        batch / total_weight,
    ))
}

/// Least-squares fit of features to targets over the neighbors
///
/// The fit is centered with an unpenalized intercept, so neighbors sharing
/// identical features predict exactly their mean. Results are kept within
/// [0.5 × smallest, 2 × largest] observed target.
pub fn linear_fit(neighbors: &[Neighbor<'_>], query: &FeatureVector, mask: &[usize]) -> Option<ParamPair> {
    if neighbors.len() < MIN_LINEAR_SAMPLES {
        return None;
    }
    let dims: Vec<usize> = mask.iter().copied().filter(|&i| i < FEATURE_COUNT).collect();
    if dims.is_empty() {
        return None;
    }

    let x = Array2::from_shape_fn((neighbors.len(), dims.len()), |(r, c)| {
        neighbors[r].record.features.get(dims[c])
    });
    let x_mean = x.mean_axis(Axis(0))?;
    let centered = &x - &x_mean;
    let q = Array1::from_iter(dims.iter().map(|&i| query.get(i))) - &x_mean;

    let workers = Array1::from_iter(neighbors.iter().map(|n| n.record.worker_count as f64));
    let batches = Array1::from_iter(neighbors.iter().map(|n| n.record.batch_size as f64));

    let w = fit_and_predict(&centered, &workers, &q)?;
    let b = fit_and_predict(&centered, &batches, &q)?;
    Some(ParamPair::from_estimates(
        clamp_to_observed(w, &workers),
        clamp_to_observed(b, &batches),
    ))
}

/// Ridge regression on centered inputs, evaluated at the centered query
fn fit_and_predict(centered: &Array2<f64>, y: &Array1<f64>, q: &Array1<f64>) -> Option<f64> {
    let y_mean = y.mean()?;
    let yc = y - y_mean;

    // Normal equations (XᵀX + λI) β = Xᵀy
    let mut xtx = centered.t().dot(centered);
    xtx.diag_mut().mapv_inplace(|v| v + RIDGE_LAMBDA);
    let xty = centered.t().dot(&yc);

    let beta = cholesky_solve(&xtx, &xty)?;
    let prediction = y_mean + beta.dot(q);
    prediction.is_finite().then_some(prediction)
}

/// Solve `a x = b` for symmetric positive-definite `a`
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    // A = L Lᵀ
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // L y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Lᵀ x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
        x[i] = (y[i] - sum) / l[[i, i]];
    }
    Some(x)
}

fn clamp_to_observed(value: f64, observed: &Array1<f64>) -> f64 {
    let min = observed.iter().copied().fold(f64::MAX, f64::min);
    let max = observed.iter().copied().fold(f64::MIN, f64::max);
    value.clamp(0.5 * min, 2.0 * max)
}

/// Inputs shared by all strategies for one query
pub struct StrategyContext<'a> {
    pub query: &'a FeatureVector,
    pub neighbors: &'a [Neighbor<'a>],
    pub mask: &'a [usize],
    pub clusterer: &'a WorkloadClusterer,
}

impl StrategyKind {
    /// Run this strategy for the query in `ctx`
    pub fn predict(&self, ctx: &StrategyContext<'_>) -> Option<ParamPair> {
        match self {
            StrategyKind::Knn => knn_average(ctx.neighbors),
            StrategyKind::Linear => linear_fit(ctx.neighbors, ctx.query, ctx.mask),
            StrategyKind::ClusterLocal => ctx
                .clusterer
                .find_best_cluster(ctx.query)
                .map(|c| ParamPair::new(c.typical_worker_count, c.typical_batch_size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::feature_index as fi;

    fn all_features() -> Vec<usize> {
        (0..FEATURE_COUNT).collect()
    }

    fn record(features: [f64; FEATURE_COUNT], workers: u32, batch: u32, trust: f64) -> HistoryRecord {
        HistoryRecord {
            features: FeatureVector::new(features),
            worker_count: workers,
            batch_size: batch,
            speedup: 2.0,
            timestamp: 0,
            streaming: None,
            adaptive: None,
            fingerprint: None,
            trust_weight: trust,
        }
    }

    #[test]
    fn test_neighbors_sorted_and_truncated() {
        let records: Vec<HistoryRecord> = (0..10)
            .map(|i| record([i as f64 / 10.0; FEATURE_COUNT], i + 1, 10, 1.0))
            .collect();
        let query = FeatureVector::new([0.0; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 3, &all_features());
        assert_eq!(neighbors.len(), 3);
        assert_eq!(neighbors[0].record.worker_count, 1);
        assert!(neighbors.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_knn_exact_match_dominates() {
        let records = vec![
            record([0.5; FEATURE_COUNT], 4, 100, 1.0),
            record([0.9; FEATURE_COUNT], 16, 10, 1.0),
        ];
        let query = FeatureVector::new([0.5; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 2, &all_features());
        assert_eq!(knn_average(&neighbors), Some(ParamPair::new(4, 100)));
    }

    #[test]
    fn test_knn_trust_weight_scales_influence() {
        let mut near = [0.5; FEATURE_COUNT];
        near[0] = 0.6;
        let mut far = [0.5; FEATURE_COUNT];
        far[0] = 0.4;
        let records = vec![record(near, 10, 10, 1.0), record(far, 2, 10, 0.0)];
        let query = FeatureVector::new([0.5; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 2, &all_features());
        assert_eq!(knn_average(&neighbors).unwrap().worker_count, 10);
    }

    #[test]
    fn test_knn_zero_trust_is_none() {
        let records = vec![record([0.5; FEATURE_COUNT], 4, 100, 0.0)];
        let query = FeatureVector::new([0.5; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 1, &all_features());
        assert_eq!(knn_average(&neighbors), None);
        assert_eq!(knn_average(&[]), None);
    }

    #[test]
    fn test_linear_requires_three_samples() {
        let records = vec![
            record([0.2; FEATURE_COUNT], 2, 10, 1.0),
            record([0.4; FEATURE_COUNT], 4, 20, 1.0),
        ];
        let query = FeatureVector::new([0.3; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 5, &all_features());
        assert_eq!(linear_fit(&neighbors, &query, &all_features()), None);
    }

    #[test]
    fn test_linear_identical_features_predict_mean() {
        let records: Vec<HistoryRecord> = (0..5)
            .map(|_| record([0.5; FEATURE_COUNT], 4, 100, 1.0))
            .collect();
        let query = FeatureVector::new([0.5; FEATURE_COUNT]);
        let neighbors = nearest_neighbors(&records, &query, 5, &all_features());
        assert_eq!(
            linear_fit(&neighbors, &query, &all_features()),
            Some(ParamPair::new(4, 100))
        );
    }

    #[test]
    fn test_cholesky_solves_spd_system() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let b = ndarray::arr1(&[10.0, 8.0]);
        let x = cholesky_solve(&a, &b).unwrap();
        assert!((x[0] - 1.75).abs() < 1e-12);
        assert!((x[1] - 1.5).abs() < 1e-12);

        let indefinite = ndarray::arr2(&[[1.0, 2.0], [2.0, 1.0]]);
        assert_eq!(cholesky_solve(&indefinite, &b), None);
    }

    #[test]
    fn test_linear_follows_trend() {
        // worker_count grows with item time
        let records: Vec<HistoryRecord> = (0..6)
            .map(|i| {
                let mut f = [0.5; FEATURE_COUNT];
                f[fi::ITEM_TIME] = 0.1 * i as f64;
                record(f, 2 + 2 * i, 50, 1.0)
            })
            .collect();
        let mut q = [0.5; FEATURE_COUNT];
        q[fi::ITEM_TIME] = 0.45;
        let query = FeatureVector::new(q);
        let mask = vec![fi::ITEM_TIME];
        let neighbors = nearest_neighbors(&records, &query, 6, &mask);
        let pair = linear_fit(&neighbors, &query, &mask).unwrap();
        assert!((10..=12).contains(&pair.worker_count), "got {}", pair.worker_count);
        assert_eq!(pair.batch_size, 50);
    }

    #[test]
    fn test_cluster_local_needs_active_clusters() {
        let clusterer = WorkloadClusterer::default();
        let query = FeatureVector::new([0.5; FEATURE_COUNT]);
        let mask = all_features();
        let ctx = StrategyContext {
            query: &query,
            neighbors: &[],
            mask: &mask,
            clusterer: &clusterer,
        };
        assert_eq!(StrategyKind::ClusterLocal.predict(&ctx), None);
        assert_eq!(StrategyKind::Knn.predict(&ctx), None);
    }

    #[test]
    fn test_param_pair_floors_at_one() {
        assert_eq!(ParamPair::from_estimates(0.2, -4.0), ParamPair::new(1, 1));
        assert_eq!(ParamPair::from_estimates(f64::NAN, 3.6), ParamPair::new(1, 4));
    }
}
