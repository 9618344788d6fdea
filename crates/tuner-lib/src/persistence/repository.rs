//! Key-value state repository
//!
//! The engine persists history records and a few singleton records through
//! this interface. `FileRepository` stores one JSON file per key and writes
//! atomically (temp file, then rename). `MemoryRepository` keeps everything
//! in memory for tests and ephemeral use.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Singleton record keys
pub mod keys {
    pub const CALIBRATION: &str = "calibration";
    pub const ENSEMBLE_WEIGHTS: &str = "ensemble_weights";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const HISTORY_PREFIX: &str = "history/";
}

/// Errors raised by a state repository
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("invalid repository key {0:?}")]
    InvalidKey(String),

    #[error("repository is read-only")]
    ReadOnly,

    #[error("I/O error for key {key:?}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Minimal key-value contract for persisted tuner state
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Load the bytes stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError>;

    /// Store `bytes` under `key`, replacing any previous value
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), RepositoryError>;

    /// Remove `key`; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), RepositoryError>;

    /// List keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RepositoryError>;
}

/// Keys are relative paths of `[A-Za-z0-9_.-]` segments separated by `/`
fn validate_key(key: &str) -> Result<(), RepositoryError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(RepositoryError::InvalidKey(key.to_string()))
    }
}

/// One JSON file per key under a root directory
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, RepositoryError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}.json", key)))
    }
}

async fn write_and_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

fn io_error(key: &str, source: io::Error) -> RepositoryError {
    RepositoryError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl StateRepository for FileRepository {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }

        // Write atomically using a temp file private to this write
        let temp_path = path.with_extension(format!(
            "json.{}.{}.tmp",
            std::process::id(),
            TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = write_and_rename(&temp_path, &path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(key, e));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "State record written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RepositoryError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let (dir_part, name_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..=idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir = self.root.join(dir_part);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(prefix, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(prefix, e))? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.starts_with(name_prefix) {
                keys.push(format!("{}{}", dir_part, stem));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory repository backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryRepository {
    entries: DashMap<String, Vec<u8>>,
    read_only: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject all writes while `read_only` is set
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(RepositoryError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateRepository for MemoryRepository {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        validate_key(key)?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        validate_key(key)?;
        self.check_writable()?;
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RepositoryError> {
        validate_key(key)?;
        self.check_writable()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("calibration").is_ok());
        assert!(validate_key("history/abc-123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("history/../secret").is_err());
        assert!(validate_key("history/").is_err());
        assert!(validate_key("a b").is_err());
    }

    #[tokio::test]
    async fn test_file_repository_round_trip() {
        let temp = TempDir::new().unwrap();
        let repo = FileRepository::new(temp.path());

        assert!(repo.load("calibration").await.unwrap().is_none());
        repo.save("calibration", b"{\"a\":1}").await.unwrap();
        assert_eq!(repo.load("calibration").await.unwrap().unwrap(), b"{\"a\":1}");

        // No temp file left behind
        let leftovers = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_to_one_key() {
        let temp = TempDir::new().unwrap();
        let repo = std::sync::Arc::new(FileRepository::new(temp.path()));

        for round in 0..20i64 {
            let writes: Vec<_> = (0..8)
                .map(|writer| {
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        let body = format!("{{\"round\":{},\"writer\":{}}}", round, writer);
                        repo.save("calibration", body.as_bytes()).await
                    })
                })
                .collect();
            for write in writes {
                write.await.unwrap().unwrap();
            }

            let stored = repo.load("calibration").await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&stored).unwrap();
            assert_eq!(value["round"], round);
        }
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_file_repository_list_and_remove() {
        let temp = TempDir::new().unwrap();
        let repo = FileRepository::new(temp.path());

        repo.save("history/b-2", b"2").await.unwrap();
        repo.save("history/a-1", b"1").await.unwrap();
        repo.save("fingerprint", b"f").await.unwrap();

        let keys = repo.list(keys::HISTORY_PREFIX).await.unwrap();
        assert_eq!(keys, vec!["history/a-1".to_string(), "history/b-2".to_string()]);

        repo.remove("history/a-1").await.unwrap();
        repo.remove("history/missing").await.unwrap();
        assert_eq!(repo.list(keys::HISTORY_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_repository_list_missing_dir() {
        let temp = TempDir::new().unwrap();
        let repo = FileRepository::new(temp.path().join("nothing-here"));
        assert!(repo.list(keys::HISTORY_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_repository_read_only() {
        let repo = MemoryRepository::new();
        repo.save("fingerprint", b"x").await.unwrap();
        repo.set_read_only(true);
        assert!(matches!(
            repo.save("fingerprint", b"y").await,
            Err(RepositoryError::ReadOnly)
        ));
        assert_eq!(repo.load("fingerprint").await.unwrap().unwrap(), b"x");
        repo.set_read_only(false);
        repo.save("fingerprint", b"y").await.unwrap();
        assert_eq!(repo.len(), 1);
    }
}
