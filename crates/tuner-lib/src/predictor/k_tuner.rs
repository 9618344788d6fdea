//! Cross-validated choice of k for the neighbor strategies

use super::ensemble::normalized_error;
use super::strategies::{knn_average, Neighbor, ParamPair};
use crate::config::TuningConfig;
use crate::models::HistoryRecord;
use tracing::debug;

/// Chooses k by cross-validating the k-NN rule over the history
#[derive(Debug, Clone)]
pub struct KTuner {
    config: TuningConfig,
    default_k: usize,
    /// (tuned k, history size it was tuned on)
    cached: Option<(usize, usize)>,
}

impl KTuner {
    pub fn new(config: TuningConfig, default_k: usize) -> Self {
        Self {
            config,
            default_k: default_k.max(1),
            cached: None,
        }
    }

    /// k to use for `records`, retuning only when the history grew enough
    pub fn current_k(&mut self, records: &[HistoryRecord], mask: &[usize]) -> usize {
        let n = records.len();
        if n <= self.config.min_samples {
            return self.default_k;
        }

        if let Some((k, tuned_at)) = self.cached {
            let limit = tuned_at as f64 * (1.0 + self.config.regrowth_ratio);
            if n >= tuned_at && n as f64 <= limit {
                return k;
            }
        }

        let k = self.tune(records, mask);
        debug!(k = k, samples = n, "Tuned neighbor count");
        self.cached = Some((k, n));
        k
    }

    pub fn cached_k(&self) -> Option<usize> {
        self.cached.map(|(k, _)| k)
    }

    fn tune(&self, records: &[HistoryRecord], mask: &[usize]) -> usize {
        let n = records.len();
        let folds = if n <= self.config.loo_max_samples {
            n
        } else {
            self.config.folds.max(2)
        };
        let k_min = self.config.k_min.max(1);
        let k_max = self.config.k_max.max(k_min);

        let mut error_sums = vec![0.0; k_max + 1];
        let mut error_counts = vec![0usize; k_max + 1];

        for (i, held_out) in records.iter().enumerate() {
            let fold = i % folds;
            let mut training: Vec<Neighbor<'_>> = records
                .iter()
                .enumerate()
                .filter(|(j, _)| j % folds != fold)
                .map(|(_, record)| Neighbor {
                    record,
                    distance: held_out.features.distance_masked(&record.features, mask),
                })
                .collect();
            training.sort_by(|a, b| a.distance.total_cmp(&b.distance));

            let actual = ParamPair::new(held_out.worker_count, held_out.batch_size);
            for k in k_min..=k_max.min(training.len()) {
                if let Some(predicted) = knn_average(&training[..k]) {
                    error_sums[k] += normalized_error(predicted, actual);
                    error_counts[k] += 1;
                }
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for k in k_min..=k_max {
            if error_counts[k] == 0 {
                continue;
            }
            let mean = error_sums[k] / error_counts[k] as f64;
            // Strict comparison keeps the smaller k on ties
            if best.map(|(_, e)| mean < e - 1e-12).unwrap_or(true) {
                best = Some((k, mean));
            }
        }
        best.map(|(k, _)| k).unwrap_or(self.default_k)
    }
}
