//! Prediction engine
//!
//! Owns the execution history and all learned state (ensemble weights,
//! calibration, tuned hyperparameters, clusters). Predictions run
//! synchronously under short critical sections; only repository access is
//! async. Locks are always taken in the order history, then learning state,
//! and never held across an await. Outcome recording is additionally
//! serialized by an async lock so persisted state never goes backwards.

use super::clustering::WorkloadClusterer;
use super::confidence::{prediction_accuracy, Calibrator, ConfidenceScorer};
use super::ensemble::{normalized_error, EnsembleWeights};
use super::feature_selection::FeatureSelector;
use super::k_tuner::KTuner;
use super::output::{OutputFormatter, PredictionDetails};
use super::strategies::{nearest_neighbors, Neighbor, ParamPair, StrategyContext};
use super::FeatureExtractor;
use crate::config::TunerConfig;
use crate::cost_model::{CostEstimate, HardwareCostModel};
use crate::history::{HistoryPruner, HistoryStore, PruneReport};
use crate::models::{
    feature_index as fi, AdaptiveChunkingParams, CalibrationState, FeatureVector, HistoryRecord,
    MachineProfile, PredictionOutcome, PredictionSource, StrategyKind, StreamingParams,
    SystemFingerprint, WorkloadKind, WorkloadProfile,
};
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::persistence::{self, keys, RecordKind, StateRepository};
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a prediction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionResult {
    /// Confidence met the calibrated threshold
    Ready(PredictionOutcome),
    /// A prediction exists but should not be trusted; measure directly instead
    LowConfidence {
        outcome: PredictionOutcome,
        threshold: f64,
        reason: String,
    },
    /// Not enough usable history to predict anything
    InsufficientData { samples: usize, required: usize },
}

impl PredictionResult {
    /// The outcome, only when it passed the confidence gate
    pub fn usable(&self) -> Option<&PredictionOutcome> {
        match self {
            PredictionResult::Ready(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// The outcome regardless of confidence
    pub fn outcome(&self) -> Option<&PredictionOutcome> {
        match self {
            PredictionResult::Ready(outcome) | PredictionResult::LowConfidence { outcome, .. } => {
                Some(outcome)
            }
            PredictionResult::InsufficientData { .. } => None,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, PredictionResult::InsufficientData { .. })
    }
}

/// Measured ground truth of one execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Identity of the computation (e.g. a function name or content hash)
    pub target: String,
    pub workload: WorkloadProfile,
    pub worker_count: u32,
    pub batch_size: u32,
    pub speedup: f64,
    pub streaming: Option<StreamingParams>,
    pub adaptive: Option<AdaptiveChunkingParams>,
    /// The prediction the execution followed, if any
    pub predicted: Option<PredictionOutcome>,
}

/// Result of an online-learning update
#[derive(Debug, Clone)]
pub struct UpdateSummary {
    /// False when any write to the repository failed
    pub persisted: bool,
    pub accuracy: Option<f64>,
    pub threshold: f64,
    pub history_len: usize,
    pub pruned: Option<PruneReport>,
}

#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub label: WorkloadKind,
    pub members: usize,
    pub typical_worker_count: u32,
    pub typical_batch_size: u32,
    pub mean_speedup: f64,
}

/// Snapshot of the engine's learned state
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub fingerprint: String,
    pub history_records: usize,
    pub usable_records: usize,
    pub threshold: f64,
    pub calibration_samples: usize,
    pub weights: BTreeMap<String, f64>,
    pub clusters: Vec<ClusterSummary>,
    pub tuned_k: Option<usize>,
}

/// Learned state guarded by one mutex
struct LearningState {
    /// History filtered and trust-weighted for this machine
    view: Vec<HistoryRecord>,
    view_generation: Option<u64>,
    clusterer: WorkloadClusterer,
    k_tuner: KTuner,
    selector: FeatureSelector,
    weights: EnsembleWeights,
    calibrator: Calibrator,
}

impl LearningState {
    /// Bring derived structures up to date; returns (feature mask, k)
    fn prepare(&mut self) -> (Vec<usize>, usize) {
        let generation = self.view_generation.unwrap_or_default();
        self.clusterer.ensure_current(&self.view, generation);
        let mask = self.selector.selected(&self.view);
        let k = self.k_tuner.current_k(&self.view, &mask);
        (mask, k)
    }
}

/// Run the applicable strategies for `features`
fn run_strategies<'a>(
    view: &'a [HistoryRecord],
    clusterer: &'a WorkloadClusterer,
    features: &'a FeatureVector,
    mask: &'a [usize],
    k: usize,
    ensemble: bool,
) -> (Vec<Neighbor<'a>>, Vec<(StrategyKind, ParamPair)>) {
    let neighbors = nearest_neighbors(view, features, k, mask);
    let ctx = StrategyContext {
        query: features,
        neighbors: &neighbors,
        mask,
        clusterer,
    };
    let kinds: &[StrategyKind] = if ensemble {
        &StrategyKind::ALL
    } else {
        &[StrategyKind::Knn]
    };
    let proposals = kinds
        .iter()
        .filter_map(|kind| kind.predict(&ctx).map(|pair| (*kind, pair)))
        .collect();
    (neighbors, proposals)
}

/// Auto-tuning prediction engine
pub struct PredictionEngine {
    config: TunerConfig,
    repository: Arc<dyn StateRepository>,
    machine: MachineProfile,
    fingerprint: SystemFingerprint,
    extractor: FeatureExtractor,
    cost_model: HardwareCostModel,
    pruner: HistoryPruner,
    formatter: OutputFormatter,
    history: RwLock<HistoryStore>,
    learning: Mutex<LearningState>,
    /// Held from the learning update until its snapshot is written
    persist_lock: tokio::sync::Mutex<()>,
    metrics: TunerMetrics,
    logger: StructuredLogger,
}

impl PredictionEngine {
    /// Load persisted state and record this machine's fingerprint
    pub async fn open(
        config: TunerConfig,
        repository: Arc<dyn StateRepository>,
        machine: MachineProfile,
    ) -> Result<Self> {
        let topology = machine.topology_or_default();
        let fingerprint =
            SystemFingerprint::new(machine.physical_cores, &topology, machine.start_method);

        let history = HistoryStore::load_all(repository.as_ref()).await?;

        let calibrator = match load_singleton::<CalibrationState>(
            repository.as_ref(),
            keys::CALIBRATION,
            RecordKind::Calibration,
        )
        .await
        {
            Some(state) => Calibrator::from_state(config.calibration.clone(), state),
            None => Calibrator::new(config.calibration.clone()),
        };

        let weights = match load_singleton::<BTreeMap<String, f64>>(
            repository.as_ref(),
            keys::ENSEMBLE_WEIGHTS,
            RecordKind::EnsembleWeights,
        )
        .await
        {
            Some(persisted) => EnsembleWeights::from_persisted(config.ensemble.clone(), &persisted),
            None => EnsembleWeights::new(config.ensemble.clone()),
        };

        if let Some(previous) = load_singleton::<SystemFingerprint>(
            repository.as_ref(),
            keys::FINGERPRINT,
            RecordKind::Fingerprint,
        )
        .await
        {
            if previous.hash != fingerprint.hash {
                info!(
                    previous = %previous.hash,
                    current = %fingerprint.hash,
                    "Machine fingerprint changed, older history will be trust-weighted"
                );
            }
        }
        if let Err(e) = save_singleton(repository.as_ref(), keys::FINGERPRINT, &fingerprint).await {
            warn!(error = %e, "Failed to persist machine fingerprint");
        }

        let metrics = TunerMetrics::new();
        metrics.set_history_records(history.len());
        metrics.set_threshold(calibrator.threshold());

        info!(
            fingerprint = %fingerprint.hash,
            records = history.len(),
            threshold = calibrator.threshold(),
            "Prediction engine ready"
        );

        let learning = LearningState {
            view: Vec::new(),
            view_generation: None,
            clusterer: WorkloadClusterer::new(config.clustering.clone()),
            k_tuner: KTuner::new(config.tuning.clone(), config.ensemble.default_k),
            selector: FeatureSelector::new(config.tuning.clone()),
            weights,
            calibrator,
        };

        Ok(Self {
            extractor: FeatureExtractor::new(),
            cost_model: HardwareCostModel::new(config.cost_model.clone()),
            pruner: HistoryPruner::new(config.pruning.clone()),
            formatter: OutputFormatter::new(),
            logger: StructuredLogger::new(fingerprint.hash.clone()),
            history: RwLock::new(history),
            learning: Mutex::new(learning),
            persist_lock: tokio::sync::Mutex::new(()),
            config,
            repository,
            machine,
            fingerprint,
            metrics,
        })
    }

    pub fn fingerprint(&self) -> &SystemFingerprint {
        &self.fingerprint
    }

    pub fn machine(&self) -> &MachineProfile {
        &self.machine
    }

    /// Normalized features of `workload` on this machine
    pub fn features(&self, workload: &WorkloadProfile) -> FeatureVector {
        self.extractor.extract(workload, &self.machine)
    }

    /// Predict parameters from history
    pub fn predict(&self, workload: &WorkloadProfile) -> Result<PredictionResult> {
        let started = Instant::now();
        let features = self.features(workload);

        let history = self
            .history
            .read()
            .map_err(|e| anyhow!("History lock poisoned: {}", e))?;
        let mut guard = self
            .learning
            .lock()
            .map_err(|e| anyhow!("Learning state lock poisoned: {}", e))?;
        let state = &mut *guard;
        self.refresh_view(&history, state);
        drop(history);

        let samples = state.view.len();
        let required = self.config.ensemble.min_prediction_samples.max(1);
        if samples < required {
            self.metrics.inc_predictions_insufficient();
            self.metrics
                .observe_prediction_latency(started.elapsed().as_secs_f64());
            debug!(samples = samples, required = required, "Insufficient history for prediction");
            return Ok(PredictionResult::InsufficientData { samples, required });
        }

        let (mask, k) = state.prepare();
        let ensemble = samples >= self.config.ensemble.min_ensemble_samples;
        let (neighbors, proposals) =
            run_strategies(&state.view, &state.clusterer, &features, &mask, k, ensemble);

        let Some(params) = state.weights.combine(&proposals) else {
            self.metrics.inc_predictions_insufficient();
            return Ok(PredictionResult::InsufficientData { samples, required });
        };

        let confidence = ConfidenceScorer.score(&neighbors, samples, mask.len());
        let outcome = self.formatter.format(PredictionDetails {
            params,
            confidence,
            neighbors: &neighbors,
            supporting_samples: neighbors.len(),
            strategies: proposals.iter().map(|(kind, _)| *kind).collect(),
            cluster: state.clusterer.find_best_cluster(&features),
            streaming: neighbors.iter().find_map(|n| n.record.streaming),
            adaptive: self.suggest_adaptive(&neighbors, &features, params.batch_size),
        });
        let threshold = state.calibrator.threshold();
        drop(guard);

        self.metrics
            .observe_prediction_latency(started.elapsed().as_secs_f64());

        match self.formatter.low_confidence_reason(&outcome, threshold) {
            None => {
                self.metrics.inc_predictions_accepted();
                self.logger.log_prediction(
                    outcome.worker_count,
                    outcome.batch_size,
                    outcome.confidence,
                    threshold,
                    outcome.supporting_samples,
                    outcome.match_quality.as_str(),
                );
                Ok(PredictionResult::Ready(outcome))
            }
            Some(reason) => {
                self.metrics.inc_predictions_rejected();
                self.logger.log_rejection(outcome.confidence, threshold, &reason);
                Ok(PredictionResult::LowConfidence {
                    outcome,
                    threshold,
                    reason,
                })
            }
        }
    }

    /// Best available parameters: a confident prediction, else the cost model
    pub fn recommend(&self, workload: &WorkloadProfile) -> Result<PredictionOutcome> {
        if let PredictionResult::Ready(outcome) = self.predict(workload)? {
            return Ok(outcome);
        }

        let recommendation = self.cost_model.recommend(
            workload,
            &self.machine.topology_or_default(),
            self.machine.start_method,
            self.machine.physical_cores,
        );
        let features = self.features(workload);
        let adaptive = self.suggest_adaptive(&[], &features, recommendation.batch_size);
        Ok(self.formatter.from_cost_model(&recommendation, adaptive))
    }

    /// Analytical estimate for explicit parameters on this machine
    pub fn estimate(&self, workload: &WorkloadProfile, worker_count: u32, batch_size: u32) -> CostEstimate {
        self.cost_model.estimate(
            worker_count,
            batch_size,
            workload,
            &self.machine.topology_or_default(),
            self.machine.start_method,
        )
    }

    /// Learn from measured ground truth
    ///
    /// Repository failures do not fail the update; they are reported through
    /// [`UpdateSummary::persisted`].
    pub async fn record_outcome(&self, report: ExecutionReport) -> Result<UpdateSummary> {
        let features = self.features(&report.workload);
        let actual = ParamPair::new(report.worker_count, report.batch_size);
        let record = HistoryRecord {
            features,
            worker_count: actual.worker_count,
            batch_size: actual.batch_size,
            speedup: if report.speedup.is_finite() { report.speedup } else { 0.0 },
            timestamp: chrono::Utc::now().timestamp(),
            streaming: report.streaming,
            adaptive: report.adaptive,
            fingerprint: Some(self.fingerprint.clone()),
            trust_weight: 1.0,
        };

        // Snapshots must reach the repository in the order they were taken
        let _persist_guard = self.persist_lock.lock().await;
        let (calibration, weights, accuracy) =
            self.learn(&features, actual, report.predicted.as_ref())?;

        let mut persisted = true;
        let key = match HistoryStore::persist(self.repository.as_ref(), &record, &report.target).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, target = %report.target, "Failed to persist execution record");
                self.metrics.inc_persistence_errors();
                persisted = false;
                None
            }
        };

        let history_len = {
            let mut history = self
                .history
                .write()
                .map_err(|e| anyhow!("History lock poisoned: {}", e))?;
            match key {
                Some(key) => history.add_with_key(record, key),
                None => history.add(record),
            }
            history.len()
        };

        let pruned = if history_len > self.config.pruning.auto_prune_size {
            Some(self.prune_history().await?)
        } else {
            None
        };

        let calibration_saved =
            save_singleton(self.repository.as_ref(), keys::CALIBRATION, &calibration).await;
        let weights_saved =
            save_singleton(self.repository.as_ref(), keys::ENSEMBLE_WEIGHTS, &weights).await;
        for (key, result) in [
            (keys::CALIBRATION, calibration_saved),
            (keys::ENSEMBLE_WEIGHTS, weights_saved),
        ] {
            if let Err(e) = result {
                warn!(key = key, error = %e, "Failed to persist learned state");
                self.metrics.inc_persistence_errors();
                persisted = false;
            }
        }

        let history_len = pruned.as_ref().map(|p| p.kept_count).unwrap_or(history_len);
        self.metrics.inc_outcomes_recorded();
        self.metrics.set_history_records(history_len);
        self.logger.log_outcome(
            actual.worker_count,
            actual.batch_size,
            report.speedup,
            accuracy,
            persisted,
        );

        Ok(UpdateSummary {
            persisted,
            accuracy,
            threshold: calibration.adjusted_threshold,
            history_len,
            pruned,
        })
    }

    /// Update ensemble weights and calibration; returns snapshots to persist
    fn learn(
        &self,
        features: &FeatureVector,
        actual: ParamPair,
        predicted: Option<&PredictionOutcome>,
    ) -> Result<(CalibrationState, BTreeMap<String, f64>, Option<f64>)> {
        let history = self
            .history
            .read()
            .map_err(|e| anyhow!("History lock poisoned: {}", e))?;
        let mut guard = self
            .learning
            .lock()
            .map_err(|e| anyhow!("Learning state lock poisoned: {}", e))?;
        let state = &mut *guard;
        self.refresh_view(&history, state);
        drop(history);

        // Score each strategy against the truth before the record joins the history
        if state.view.len() >= self.config.ensemble.min_prediction_samples.max(1) {
            let (mask, k) = state.prepare();
            let ensemble = state.view.len() >= self.config.ensemble.min_ensemble_samples;
            let (_, proposals) =
                run_strategies(&state.view, &state.clusterer, features, &mask, k, ensemble);
            for (kind, pair) in proposals {
                state.weights.update(kind, normalized_error(pair, actual));
            }
        }

        let accuracy = predicted.map(|p| {
            prediction_accuracy(ParamPair::new(p.worker_count, p.batch_size), actual)
        });
        if let (Some(p), Some(accuracy)) = (predicted, accuracy) {
            if p.source == PredictionSource::History {
                let old = state.calibrator.threshold();
                let now = chrono::Utc::now().timestamp();
                if let Some(new) = state.calibrator.record(p.confidence, accuracy, now) {
                    self.logger
                        .log_calibration(old, new, state.calibrator.sample_count());
                    self.metrics.set_threshold(new);
                }
            }
        }

        Ok((
            state.calibrator.state().clone(),
            state.weights.to_persisted(),
            accuracy,
        ))
    }

    /// Prune the history now, deleting evicted records from the repository
    pub async fn prune_history(&self) -> Result<PruneReport> {
        let (report, removed_keys) = {
            let mut history = self
                .history
                .write()
                .map_err(|e| anyhow!("History lock poisoned: {}", e))?;
            let outcome = self
                .pruner
                .prune(history.records(), chrono::Utc::now().timestamp());
            if outcome.report.removed_count == 0 {
                return Ok(outcome.report);
            }
            let removed = history.retain_indices(&outcome.kept);
            (outcome.report, removed)
        };

        for key in &removed_keys {
            if let Err(e) = self.repository.remove(key).await {
                warn!(key = %key, error = %e, "Failed to delete pruned record");
                self.metrics.inc_persistence_errors();
            }
        }

        self.metrics.add_records_pruned(report.removed_count);
        self.metrics.set_history_records(report.kept_count);
        self.logger.log_pruning(
            report.original_count,
            report.removed_count,
            report.clusters,
            report.reclaimed_bytes,
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let history = self
            .history
            .read()
            .map_err(|e| anyhow!("History lock poisoned: {}", e))?;
        let mut guard = self
            .learning
            .lock()
            .map_err(|e| anyhow!("Learning state lock poisoned: {}", e))?;
        let state = &mut *guard;
        self.refresh_view(&history, state);
        let history_records = history.len();
        drop(history);

        let generation = state.view_generation.unwrap_or_default();
        state.clusterer.ensure_current(&state.view, generation);

        Ok(EngineStats {
            fingerprint: self.fingerprint.hash.clone(),
            history_records,
            usable_records: state.view.len(),
            threshold: state.calibrator.threshold(),
            calibration_samples: state.calibrator.sample_count(),
            weights: state.weights.to_persisted(),
            clusters: state
                .clusterer
                .clusters()
                .iter()
                .map(|c| ClusterSummary {
                    label: c.label,
                    members: c.members.len(),
                    typical_worker_count: c.typical_worker_count,
                    typical_batch_size: c.typical_batch_size,
                    mean_speedup: c.mean_speedup,
                })
                .collect(),
            tuned_k: state.k_tuner.cached_k(),
        })
    }

    fn refresh_view(&self, history: &HistoryStore, state: &mut LearningState) {
        let generation = history.generation();
        if state.view_generation == Some(generation) {
            return;
        }
        state.view = history.filter_by_similarity(
            &self.fingerprint,
            self.config.transfer.min_similarity,
            self.config.transfer.cross_weight,
        );
        state.view_generation = Some(generation);
    }

    /// Adaptive chunking from the nearest record that used it, or for high-variance workloads
    fn suggest_adaptive(
        &self,
        neighbors: &[Neighbor<'_>],
        features: &FeatureVector,
        batch_size: u32,
    ) -> Option<AdaptiveChunkingParams> {
        if let Some(adaptive) = neighbors.iter().find_map(|n| n.record.adaptive) {
            return Some(adaptive);
        }
        let chunking = &self.config.chunking;
        if features.get(fi::TIME_VARIANCE) <= chunking.variance_trigger {
            return None;
        }
        let min_batch_size = (batch_size / 4).max(chunking.min_batch_size).max(1);
        let max_batch_size = batch_size
            .saturating_mul(4)
            .min(chunking.max_batch_size)
            .max(min_batch_size);
        Some(AdaptiveChunkingParams {
            enabled: true,
            adaptation_rate: chunking.adaptation_rate,
            min_batch_size,
            max_batch_size,
        })
    }
}

async fn load_singleton<T: DeserializeOwned>(
    repository: &dyn StateRepository,
    key: &str,
    kind: RecordKind,
) -> Option<T> {
    match repository.load(key).await {
        Ok(Some(bytes)) => match persistence::decode::<T>(&bytes, kind) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key, error = %e, "Malformed persisted record, using defaults");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(key = key, error = %e, "Failed to read persisted record, using defaults");
            None
        }
    }
}

async fn save_singleton<T: Serialize>(
    repository: &dyn StateRepository,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = persistence::encode(value)?;
    repository.save(key, &bytes).await?;
    Ok(())
}
