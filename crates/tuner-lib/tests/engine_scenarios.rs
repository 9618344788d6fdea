//! End-to-end tests for the prediction engine and chunked execution

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tuner_lib::config::ChunkingConfig;
use tuner_lib::persistence::{encode, keys};
use tuner_lib::*;

/// Helper to create a workstation-class machine
fn create_test_machine() -> MachineProfile {
    MachineProfile {
        physical_cores: 8,
        memory_bytes: 16 * 1024 * 1024 * 1024,
        start_method: StartMethod::Fork,
        topology: None,
    }
}

/// Helper to create a workload with the given per-item cost
fn create_test_workload(per_item_secs: f64) -> WorkloadProfile {
    WorkloadProfile {
        dataset_size: 10_000,
        per_item_secs,
        item_bytes: 256,
        result_bytes: 64,
        variance_coefficient: 0.1,
        complexity_secs: None,
    }
}

/// Helper to create a measured execution
fn create_test_report(workers: u32, batch: u32, predicted: Option<PredictionOutcome>) -> ExecutionReport {
    ExecutionReport {
        target: "fn:transform".to_string(),
        workload: create_test_workload(0.01),
        worker_count: workers,
        batch_size: batch,
        speedup: 3.4,
        streaming: None,
        adaptive: None,
        predicted,
    }
}

async fn open_engine(repo: Arc<dyn StateRepository>, machine: MachineProfile) -> PredictionEngine {
    PredictionEngine::open(TunerConfig::default(), repo, machine)
        .await
        .expect("engine opens")
}

mod prediction_tests {
    use super::*;

    #[tokio::test]
    async fn test_consistent_history_gives_confident_prediction() {
        let engine = open_engine(Arc::new(MemoryRepository::new()), create_test_machine()).await;
        for _ in 0..20 {
            engine.record_outcome(create_test_report(4, 100, None)).await.unwrap();
        }

        let result = engine.predict(&create_test_workload(0.01)).unwrap();
        let outcome = result.usable().expect("confident prediction");
        assert_eq!(outcome.worker_count, 4);
        assert_eq!(outcome.batch_size, 100);
        assert_eq!(outcome.match_quality, MatchQuality::Exact);
        assert_eq!(outcome.source, PredictionSource::History);
        assert_eq!(outcome.supporting_samples, 5);
        assert!(outcome.rationale.contains("4 workers"));
    }

    #[tokio::test]
    async fn test_empty_history_reports_insufficient_data() {
        let engine = open_engine(Arc::new(MemoryRepository::new()), create_test_machine()).await;
        match engine.predict(&create_test_workload(0.01)).unwrap() {
            PredictionResult::InsufficientData { samples, required } => {
                assert_eq!(samples, 0);
                assert!(required >= 1);
            }
            other => panic!("expected insufficient data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_worker_machine_recommendation() {
        let machine = MachineProfile {
            physical_cores: 1,
            ..create_test_machine()
        };
        let engine = open_engine(Arc::new(MemoryRepository::new()), machine).await;
        let outcome = engine.recommend(&create_test_workload(0.001)).unwrap();
        assert_eq!(outcome.source, PredictionSource::CostModel);
        assert_eq!(outcome.worker_count, 1);
        assert!(outcome.batch_size >= 1);
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_learned_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let repo: Arc<dyn StateRepository> = Arc::new(FileRepository::new(dir.path()));

        let (threshold, weights) = {
            let engine = open_engine(repo.clone(), create_test_machine()).await;
            for _ in 0..20 {
                engine.record_outcome(create_test_report(4, 100, None)).await.unwrap();
            }
            let baseline = engine.stats().unwrap().threshold;

            let outcome = engine
                .predict(&create_test_workload(0.01))
                .unwrap()
                .usable()
                .cloned()
                .expect("confident prediction");
            for _ in 0..15 {
                let summary = engine
                    .record_outcome(create_test_report(4, 100, Some(outcome.clone())))
                    .await
                    .unwrap();
                assert_eq!(summary.accuracy, Some(1.0));
                assert!(summary.persisted);
            }

            let stats = engine.stats().unwrap();
            assert_eq!(stats.calibration_samples, 15);
            assert!(stats.threshold > baseline);
            (stats.threshold, stats.weights)
        };

        let reopened = open_engine(repo, create_test_machine()).await;
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.history_records, 35);
        assert_eq!(stats.calibration_samples, 15);
        assert!((stats.threshold - threshold).abs() < 1e-9);
        assert_eq!(stats.weights, weights);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_learning_in_memory() {
        let repo = Arc::new(MemoryRepository::new());
        repo.set_read_only(true);
        let engine = open_engine(repo.clone(), create_test_machine()).await;

        let summary = engine.record_outcome(create_test_report(4, 100, None)).await.unwrap();
        assert!(!summary.persisted);
        assert_eq!(summary.history_len, 1);
        assert_eq!(engine.stats().unwrap().history_records, 1);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_and_malformed_records_on_load() {
        let repo = Arc::new(MemoryRepository::new());
        let legacy = serde_json::json!({
            "features": [0.1, 0.2, 0.3, 0.4, 0.0, 0.5, 0.1, 0.2, 0.3, 0.0, 0.4, 0.0],
            "worker_count": 2,
            "batch_size": 50,
            "speedup": 1.8,
            "timestamp": 1_700_000_000
        });
        repo.save("history/legacy-0", &serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();
        repo.save("history/broken-0", b"{not json").await.unwrap();

        let engine = open_engine(repo, create_test_machine()).await;
        let stats = engine.stats().unwrap();
        assert_eq!(stats.history_records, 1);
        assert_eq!(stats.usable_records, 1);
    }

    #[tokio::test]
    async fn test_pruning_removes_repository_entries() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = open_engine(repo.clone(), create_test_machine()).await;
        for _ in 0..60 {
            engine.record_outcome(create_test_report(4, 100, None)).await.unwrap();
        }

        let report = engine.prune_history().await.unwrap();
        assert_eq!(report.original_count, 60);
        assert_eq!(report.kept_count, 20);
        assert_eq!(report.removed_count, 40);
        assert!(report.reclaimed_bytes > 0);

        let remaining = repo.list(keys::HISTORY_PREFIX).await.unwrap();
        assert_eq!(remaining.len(), 20);
        assert_eq!(engine.stats().unwrap().history_records, 20);
    }
}

mod concurrency_tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tuner_lib::history::HistoryStore;

    /// Repository whose first calibration write stalls, letting later writes overtake it
    struct StalledCalibrationRepository {
        inner: MemoryRepository,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl StateRepository for StalledCalibrationRepository {
        async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
            if key == keys::CALIBRATION && !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save(key, bytes).await
        }

        async fn remove(&self, key: &str) -> Result<(), RepositoryError> {
            self.inner.remove(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
            self.inner.list(prefix).await
        }
    }

    /// Helper to create a history-sourced prediction the caller followed
    fn create_test_prediction() -> PredictionOutcome {
        PredictionOutcome {
            worker_count: 4,
            batch_size: 100,
            confidence: 0.9,
            rationale: String::new(),
            supporting_samples: 5,
            match_quality: MatchQuality::Exact,
            streaming: None,
            adaptive: None,
            source: PredictionSource::History,
            strategies_used: vec![StrategyKind::Knn],
        }
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_persist_latest_state() {
        let repo = Arc::new(StalledCalibrationRepository {
            inner: MemoryRepository::new(),
            stalled: AtomicBool::new(false),
        });
        let engine = open_engine(repo.clone(), create_test_machine()).await;

        let (first, second) = tokio::join!(
            engine.record_outcome(create_test_report(4, 100, Some(create_test_prediction()))),
            engine.record_outcome(create_test_report(4, 100, Some(create_test_prediction()))),
        );
        assert!(first.unwrap().persisted);
        assert!(second.unwrap().persisted);
        assert_eq!(engine.stats().unwrap().calibration_samples, 2);

        let reopened = open_engine(repo, create_test_machine()).await;
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.calibration_samples, 2);
        assert_eq!(stats.history_records, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_saves_leave_a_readable_record() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FileRepository::new(dir.path()));

        for round in 0..25u32 {
            let writes: Vec<_> = (0..8u32)
                .map(|writer| {
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        let state = CalibrationState::new(0.5 + (round * 8 + writer) as f64 * 1e-4);
                        repo.save(keys::CALIBRATION, &encode(&state).unwrap()).await
                    })
                })
                .collect();
            for write in writes {
                write.await.unwrap().expect("save succeeds");
            }
            let stored = repo.load(keys::CALIBRATION).await.unwrap().unwrap();
            let state: CalibrationState =
                tuner_lib::persistence::decode(&stored, tuner_lib::persistence::RecordKind::Calibration)
                    .expect("stored record is intact");
            assert!(state.baseline_threshold >= 0.5);
        }
    }

    #[tokio::test]
    async fn test_out_of_range_features_clamped_on_load() {
        let repo = MemoryRepository::new();
        let record = serde_json::json!({
            "features": [5.0, -3.0, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
            "worker_count": 4,
            "batch_size": 100,
            "speedup": 3.0,
            "timestamp": 1_700_000_000,
            "streaming": null,
            "adaptive": null,
            "fingerprint": null,
            "trust_weight": 1.0
        });
        let envelope = serde_json::json!({"format_version": 2, "payload": record});
        repo.save("history/tampered-0", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();

        let store = HistoryStore::load_all(&repo).await.unwrap();
        assert_eq!(store.len(), 1);
        let features = store.records()[0].features;
        assert_eq!(features.get(0), 1.0);
        assert_eq!(features.get(1), 0.0);
        assert!(features.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }
}

mod transfer_tests {
    use super::*;

    /// Helper to seed a repository with records measured on `machine`
    async fn create_test_history(machine: &MachineProfile, count: usize) -> Arc<MemoryRepository> {
        let repo = Arc::new(MemoryRepository::new());
        let extractor = FeatureExtractor::new();
        let topology = machine.topology_or_default();
        let origin = SystemFingerprint::new(machine.physical_cores, &topology, machine.start_method);
        for i in 0..count {
            let record = HistoryRecord {
                features: extractor.extract(&create_test_workload(0.01), machine),
                worker_count: 4,
                batch_size: 100,
                speedup: 3.0,
                timestamp: chrono::Utc::now().timestamp(),
                streaming: None,
                adaptive: None,
                fingerprint: Some(origin.clone()),
                trust_weight: 1.0,
            };
            let key = format!("{}remote-{}", keys::HISTORY_PREFIX, i);
            repo.save(&key, &encode(&record).unwrap()).await.unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_dissimilar_machine_history_is_excluded() {
        let remote = MachineProfile {
            physical_cores: 64,
            memory_bytes: 512 * 1024 * 1024 * 1024,
            start_method: StartMethod::Spawn,
            topology: Some(HardwareTopology {
                l3_cache_bytes: 256 * 1024 * 1024,
                numa_nodes: 8,
                has_numa: true,
                memory_bandwidth_gbps: 300.0,
                ..HardwareTopology::default()
            }),
        };
        let repo = create_test_history(&remote, 12).await;
        let engine = open_engine(repo, create_test_machine()).await;

        let stats = engine.stats().unwrap();
        assert_eq!(stats.history_records, 12);
        assert_eq!(stats.usable_records, 0);
        assert!(engine.predict(&create_test_workload(0.01)).unwrap().is_insufficient());
    }

    #[tokio::test]
    async fn test_similar_machine_history_is_used() {
        let remote = MachineProfile {
            topology: Some(HardwareTopology {
                memory_bandwidth_gbps: 26.0,
                ..HardwareTopology::default()
            }),
            ..create_test_machine()
        };
        let repo = create_test_history(&remote, 12).await;
        let engine = open_engine(repo, create_test_machine()).await;
        assert_ne!(
            engine.fingerprint().hash,
            SystemFingerprint::new(8, &remote.topology_or_default(), StartMethod::Fork).hash
        );

        let stats = engine.stats().unwrap();
        assert_eq!(stats.usable_records, 12);
        let result = engine.predict(&create_test_workload(0.01)).unwrap();
        let outcome = result.outcome().expect("prediction from transferred history");
        assert_eq!((outcome.worker_count, outcome.batch_size), (4, 100));
    }
}

mod chunking_tests {
    use super::*;

    #[test]
    fn test_slow_batches_shrink_batch_size() {
        let controller = AdaptiveChunkController::new(100, ChunkingConfig::default());
        for _ in 0..2 {
            assert!(controller.record_batch(100, Duration::from_millis(500)).is_none());
        }
        let resize = controller
            .record_batch(100, Duration::from_millis(500))
            .expect("third slow batch resizes");
        assert_eq!(resize.new_size, 70);
        assert_eq!(controller.stats().current_batch_size, 70);
    }

    #[tokio::test]
    async fn test_runner_follows_predicted_parameters() {
        let engine = open_engine(Arc::new(MemoryRepository::new()), create_test_machine()).await;
        let outcome = engine.recommend(&create_test_workload(0.0001)).unwrap();

        let controller = Arc::new(match outcome.adaptive {
            Some(params) => AdaptiveChunkController::from_params(
                outcome.batch_size,
                &params,
                ChunkingConfig::default(),
            ),
            None => AdaptiveChunkController::fixed(outcome.batch_size),
        });
        let runner = ChunkRunner::start(
            outcome.worker_count as usize,
            controller,
            |x: u64| x + 1,
        );
        runner.submit(0..1_000u64).unwrap();
        let summary = runner.join().await;

        assert_eq!(summary.items_completed, 1_000);
        assert_eq!(summary.results.first(), Some(&1));
        assert_eq!(summary.results.last(), Some(&1_000));
    }
}
