//! Correlation-based feature selection for distance computations

use crate::config::TuningConfig;
use crate::models::{HistoryRecord, FEATURE_COUNT, FEATURE_NAMES};
use tracing::debug;

/// Picks the features most correlated with the tuned parameters
#[derive(Debug, Clone)]
pub struct FeatureSelector {
    config: TuningConfig,
    /// (selected indices, history size they were computed on)
    cached: Option<(Vec<usize>, usize)>,
}

impl FeatureSelector {
    pub fn new(config: TuningConfig) -> Self {
        Self {
            config,
            cached: None,
        }
    }

    /// Sorted feature indices to use for `records`
    pub fn selected(&mut self, records: &[HistoryRecord]) -> Vec<usize> {
        let n = records.len();
        if n <= self.config.selection_min_samples {
            return all_features();
        }

        if let Some((selected, computed_at)) = &self.cached {
            let limit = *computed_at as f64 * (1.0 + self.config.regrowth_ratio);
            if n >= *computed_at && n as f64 <= limit {
                return selected.clone();
            }
        }

        let selected = self.rank(records);
        debug!(
            features = ?selected.iter().map(|&i| FEATURE_NAMES[i]).collect::<Vec<_>>(),
            samples = n,
            "Selected distance features"
        );
        self.cached = Some((selected.clone(), n));
        selected
    }

    fn rank(&self, records: &[HistoryRecord]) -> Vec<usize> {
        let workers: Vec<f64> = records.iter().map(|r| r.worker_count as f64).collect();
        let batches: Vec<f64> = records.iter().map(|r| r.batch_size as f64).collect();

        let worker_ranks = ranks_by_correlation(records, &workers);
        let batch_ranks = ranks_by_correlation(records, &batches);

        let mut order: Vec<usize> = (0..FEATURE_COUNT).collect();
        order.sort_by(|&a, &b| {
            let ra = worker_ranks[a] + batch_ranks[a];
            let rb = worker_ranks[b] + batch_ranks[b];
            ra.cmp(&rb).then(a.cmp(&b))
        });

        let count = self.config.selected_features.clamp(1, FEATURE_COUNT);
        let mut selected: Vec<usize> = order.into_iter().take(count).collect();
        selected.sort_unstable();
        selected
    }
}

impl Default for FeatureSelector {
    fn default() -> Self {
        Self::new(TuningConfig::default())
    }
}

pub fn all_features() -> Vec<usize> {
    (0..FEATURE_COUNT).collect()
}

/// Rank position of every feature (0 = strongest |r| against `target`)
fn ranks_by_correlation(records: &[HistoryRecord], target: &[f64]) -> [usize; FEATURE_COUNT] {
    let mut strength = [0.0; FEATURE_COUNT];
    for (i, s) in strength.iter_mut().enumerate() {
        let column: Vec<f64> = records.iter().map(|r| r.features.get(i)).collect();
        *s = pearson(&column, target).abs();
    }

    let mut order: Vec<usize> = (0..FEATURE_COUNT).collect();
    order.sort_by(|&a, &b| strength[b].total_cmp(&strength[a]).then(a.cmp(&b)));

    let mut ranks = [0usize; FEATURE_COUNT];
    for (rank, feature) in order.into_iter().enumerate() {
        ranks[feature] = rank;
    }
    ranks
}

/// Pearson correlation; 0.0 when either series is constant
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x[..n].iter().zip(y[..n].iter()) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    if r.is_finite() {
        r
    } else {
        0.0
    }
}
