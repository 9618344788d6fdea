//! Append-only store of past executions
//!
//! Records are held in memory and mirrored to the state repository under
//! `history/<target-hash>-<micros>-<seq>`. A generation counter changes on
//! every mutation so derived structures (clusters, tuned k, selected
//! features) can be invalidated lazily.

use crate::models::{HistoryRecord, SystemFingerprint};
use crate::persistence::{self, keys, RecordKind, StateRepository};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static KEY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Repository key for a record of `target` written now
pub fn record_key(target: &str) -> String {
    let digest = Sha256::digest(target.as_bytes());
    let micros = chrono::Utc::now().timestamp_micros();
    let seq = KEY_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}{}-{}-{}",
        keys::HISTORY_PREFIX,
        hex::encode(&digest[..8]),
        micros,
        seq
    )
}

/// In-memory history with optional repository keys
#[derive(Debug, Default, Clone)]
pub struct HistoryStore {
    records: Vec<HistoryRecord>,
    keys: Vec<Option<String>>,
    generation: u64,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<HistoryRecord>) -> Self {
        let keys = vec![None; records.len()];
        Self {
            records,
            keys,
            generation: 0,
        }
    }

    /// Load every history record from the repository, skipping malformed ones
    pub async fn load_all(repository: &dyn StateRepository) -> Result<Self> {
        let record_keys = repository
            .list(keys::HISTORY_PREFIX)
            .await
            .context("Failed to list history records")?;

        let mut store = Self::new();
        let mut skipped = 0usize;
        for key in record_keys {
            let bytes = match repository.load(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read history record, skipping");
                    skipped += 1;
                    continue;
                }
            };
            match persistence::decode::<HistoryRecord>(&bytes, RecordKind::History) {
                Ok(record) => store.push(record, Some(key)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Malformed history record, skipping");
                    skipped += 1;
                }
            }
        }

        info!(records = store.len(), skipped = skipped, "Loaded execution history");
        Ok(store)
    }

    /// Persist one record, returning its repository key
    pub async fn persist(
        repository: &dyn StateRepository,
        record: &HistoryRecord,
        target: &str,
    ) -> Result<String> {
        let key = record_key(target);
        let bytes = persistence::encode(record)?;
        repository
            .save(&key, &bytes)
            .await
            .with_context(|| format!("Failed to persist history record {}", key))?;
        debug!(key = %key, "History record persisted");
        Ok(key)
    }

    pub fn add(&mut self, record: HistoryRecord) {
        self.push(record, None);
    }

    pub fn add_with_key(&mut self, record: HistoryRecord, key: String) {
        self.push(record, Some(key));
    }

    fn push(&mut self, record: HistoryRecord, key: Option<String>) {
        self.records.push(record);
        self.keys.push(key);
        self.generation += 1;
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Monotonic counter bumped by every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Keep only the records at `kept` indices; returns repository keys of removed records
    pub fn retain_indices(&mut self, kept: &[usize]) -> Vec<String> {
        let mut keep_mask = vec![false; self.records.len()];
        for &i in kept {
            if i < keep_mask.len() {
                keep_mask[i] = true;
            }
        }

        let records = std::mem::take(&mut self.records);
        let keys = std::mem::take(&mut self.keys);
        let mut removed_keys = Vec::new();
        for ((record, key), keep) in records.into_iter().zip(keys).zip(keep_mask) {
            if keep {
                self.records.push(record);
                self.keys.push(key);
            } else if let Some(key) = key {
                removed_keys.push(key);
            }
        }
        self.generation += 1;
        removed_keys
    }

    /// Records usable on the machine identified by `current`, with trust weights applied
    ///
    /// Same-machine records (and records without an origin) get weight 1.0.
    /// Records from other machines are kept only when their similarity is at
    /// least `min_similarity`, weighted by `cross_weight * similarity`.
    pub fn filter_by_similarity(
        &self,
        current: &SystemFingerprint,
        min_similarity: f64,
        cross_weight: f64,
    ) -> Vec<HistoryRecord> {
        self.records
            .iter()
            .filter_map(|record| {
                let weight = match &record.fingerprint {
                    None => 1.0,
                    Some(origin) if origin.hash == current.hash => 1.0,
                    Some(origin) => {
                        let similarity = current.similarity(origin);
                        if similarity < min_similarity {
                            return None;
                        }
                        cross_weight * similarity
                    }
                };
                let mut weighted = record.clone();
                weighted.trust_weight = weight.clamp(0.0, 1.0);
                Some(weighted)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, HardwareTopology, StartMethod, FEATURE_COUNT};
    use crate::persistence::MemoryRepository;

    fn fingerprint(cores: u32, bw: f64, start: StartMethod) -> SystemFingerprint {
        let topology = HardwareTopology {
            memory_bandwidth_gbps: bw,
            ..HardwareTopology::default()
        };
        SystemFingerprint::new(cores, &topology, start)
    }

    fn record(workers: u32, origin: Option<SystemFingerprint>) -> HistoryRecord {
        HistoryRecord {
            features: FeatureVector::new([0.5; FEATURE_COUNT]),
            worker_count: workers,
            batch_size: 100,
            speedup: 2.0,
            timestamp: 1_700_000_000,
            streaming: None,
            adaptive: None,
            fingerprint: origin,
            trust_weight: 1.0,
        }
    }

    #[test]
    fn test_filter_by_similarity_weights() {
        let local = fingerprint(8, 40.0, StartMethod::Fork);
        let similar = fingerprint(10, 45.0, StartMethod::Fork);
        let distant = fingerprint(128, 500.0, StartMethod::Spawn);

        let store = HistoryStore::from_records(vec![
            record(4, Some(local.clone())),
            record(5, Some(similar.clone())),
            record(6, Some(distant)),
            record(7, None),
        ]);

        let filtered = store.filter_by_similarity(&local, 0.8, 0.7);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0].trust_weight, 1.0);
        let expected = 0.7 * local.similarity(&similar);
        assert!((filtered[1].trust_weight - expected).abs() < 1e-12);
        assert_eq!(filtered[2].worker_count, 7);
        assert_eq!(filtered[2].trust_weight, 1.0);
    }

    #[test]
    fn test_generation_bumps() {
        let mut store = HistoryStore::new();
        let g0 = store.generation();
        store.add(record(2, None));
        assert!(store.generation() > g0);
        let g1 = store.generation();
        store.retain_indices(&[0]);
        assert!(store.generation() > g1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_retain_indices_returns_removed_keys() {
        let mut store = HistoryStore::new();
        store.add_with_key(record(1, None), "history/a".to_string());
        store.add_with_key(record(2, None), "history/b".to_string());
        store.add(record(3, None));
        let removed = store.retain_indices(&[1]);
        assert_eq!(removed, vec!["history/a".to_string()]);
        assert_eq!(store.records()[0].worker_count, 2);
    }

    #[tokio::test]
    async fn test_persist_and_load_skips_malformed() {
        let repo = MemoryRepository::new();
        HistoryStore::persist(&repo, &record(4, None), "fn:square").await.unwrap();
        HistoryStore::persist(&repo, &record(8, None), "fn:square").await.unwrap();
        repo.save("history/garbage-1", b"{not json").await.unwrap();

        let store = HistoryStore::load_all(&repo).await.unwrap();
        assert_eq!(store.len(), 2);
        let mut workers: Vec<u32> = store.records().iter().map(|r| r.worker_count).collect();
        workers.sort();
        assert_eq!(workers, vec![4, 8]);
    }

    #[test]
    fn test_record_keys_unique() {
        let a = record_key("fn:square");
        let b = record_key("fn:square");
        assert_ne!(a, b);
        assert!(a.starts_with(keys::HISTORY_PREFIX));
    }
}
