//! Importance-weighted history pruning
//!
//! Groups records by single-linkage similarity, scores each record by age
//! and achieved speedup, and keeps the best spread-out records per group.
//! A global floor guarantees a minimum number of survivors.

use crate::config::PruningConfig;
use crate::models::{HistoryRecord, FEATURE_COUNT};
use serde::Serialize;

const SECS_PER_DAY: f64 = 86_400.0;

/// Summary of a pruning pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PruneReport {
    pub original_count: usize,
    pub kept_count: usize,
    pub removed_count: usize,
    pub removed_ratio: f64,
    pub clusters: usize,
    pub reclaimed_bytes: usize,
}

/// Indices to keep plus the report
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub kept: Vec<usize>,
    pub report: PruneReport,
}

/// Decides which history records survive
#[derive(Debug, Clone, Default)]
pub struct HistoryPruner {
    config: PruningConfig,
}

impl HistoryPruner {
    pub fn new(config: PruningConfig) -> Self {
        Self { config }
    }

    /// Compute the records to keep; `now` is a unix timestamp in seconds
    pub fn prune(&self, records: &[HistoryRecord], now: i64) -> PruneOutcome {
        let n = records.len();
        if n < self.config.min_store_size {
            return PruneOutcome {
                kept: (0..n).collect(),
                report: self.report(n, n, 0),
            };
        }

        let clusters = self.group(records);
        let scores = self.importance_scores(records, now);

        let mut kept_mask = vec![false; n];
        for members in &clusters {
            for i in self.select_from_cluster(records, members, &scores) {
                kept_mask[i] = true;
            }
        }

        // Global floor regardless of how the clustering turned out
        let floor = self.config.global_minimum.min(n);
        let mut kept_count = kept_mask.iter().filter(|k| **k).count();
        if kept_count < floor {
            let mut remaining: Vec<usize> = (0..n).filter(|&i| !kept_mask[i]).collect();
            remaining.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
            for i in remaining.into_iter().take(floor - kept_count) {
                kept_mask[i] = true;
            }
            kept_count = floor;
        }

        let kept: Vec<usize> = (0..n).filter(|&i| kept_mask[i]).collect();
        debug_assert_eq!(kept.len(), kept_count);
        PruneOutcome {
            report: self.report(n, kept.len(), clusters.len()),
            kept,
        }
    }

    fn report(&self, original: usize, kept: usize, clusters: usize) -> PruneReport {
        let removed = original - kept;
        PruneReport {
            original_count: original,
            kept_count: kept,
            removed_count: removed,
            removed_ratio: if original == 0 {
                0.0
            } else {
                removed as f64 / original as f64
            },
            clusters,
            reclaimed_bytes: removed * self.config.bytes_per_record,
        }
    }

    /// Single-linkage grouping: records within the radius share a group
    fn group(&self, records: &[HistoryRecord]) -> Vec<Vec<usize>> {
        let n = records.len();
        let radius = self.config.similarity_radius * (FEATURE_COUNT as f64).sqrt();
        let mut parent: Vec<usize> = (0..n).collect();

        for i in 0..n {
            for j in (i + 1)..n {
                if records[i].features.distance(&records[j].features) <= radius {
                    union(&mut parent, i, j);
                }
            }
        }

        let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
        for i in 0..n {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(i);
        }
        groups.into_values().collect()
    }

    fn importance_scores(&self, records: &[HistoryRecord], now: i64) -> Vec<f64> {
        let max_speedup = records
            .iter()
            .map(|r| r.speedup)
            .filter(|s| s.is_finite())
            .fold(0.0_f64, f64::max);
        let half_life = self.config.age_half_life_days.max(f64::EPSILON);

        records
            .iter()
            .map(|r| {
                let age_days = now.saturating_sub(r.timestamp).max(0) as f64 / SECS_PER_DAY;
                let decay = (-std::f64::consts::LN_2 * age_days / half_life).exp();
                let performance = if max_speedup > 0.0 && r.speedup.is_finite() {
                    (r.speedup / max_speedup).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                self.config.base_weight
                    + self.config.age_weight * decay
                    + self.config.performance_weight * performance
            })
            .collect()
    }

    fn select_from_cluster(
        &self,
        records: &[HistoryRecord],
        members: &[usize],
        scores: &[f64],
    ) -> Vec<usize> {
        let mut ranked = members.to_vec();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let mut kept: Vec<usize> = Vec::new();
        let mut skipped: Vec<usize> = Vec::new();
        for &candidate in &ranked {
            if kept.len() >= self.config.max_per_cluster {
                break;
            }
            let spread_out = kept.iter().all(|&k| {
                records[k].features.distance(&records[candidate].features)
                    >= self.config.min_kept_distance
            });
            if spread_out {
                kept.push(candidate);
            } else {
                skipped.push(candidate);
            }
        }

        // Near-duplicates still fill the per-cluster minimum
        let minimum = self.config.min_per_cluster.min(members.len());
        for candidate in skipped {
            if kept.len() >= minimum {
                break;
            }
            kept.push(candidate);
        }
        kept
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}
