//! Persistence of the last announced id per source, and the novelty decision
//! built on top of it.
//!
//! # Layout
//!
//! ```text
//! state_dir/
//! ├── rbc_crypto          # "2670738"
//! ├── investing_latest
//! └── investing_popular
//! ```
//!
//! Each file holds one id as plain text. Writes land in a temp file next to
//! the target and are renamed over it, so a crash mid-write leaves either the
//! old id or the new one.

use crate::error::StoreError;
use crate::models::normalize_id;
use crate::queue::PendingQueue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Backend holding one string per source name.
#[async_trait]
pub trait IdStore: Send + Sync {
    /// The stored id, or `None` if nothing was ever committed.
    async fn load(&self, source: &str) -> Result<Option<String>, StoreError>;

    async fn save(&self, source: &str, id: &str) -> Result<(), StoreError>;
}

/// One plain-text file per source under a state directory.
#[derive(Debug, Clone)]
pub struct FileIdStore {
    dir: PathBuf,
}

impl FileIdStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: &str) -> Result<PathBuf, StoreError> {
        Ok(self.dir.join(file_name(source)?))
    }
}

/// Map a source name onto a safe file name.
fn file_name(source: &str) -> Result<String, StoreError> {
    let name: String = source
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        return Err(StoreError::InvalidKey(source.to_string()));
    }
    Ok(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl IdStore for FileIdStore {
    async fn load(&self, source: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(source)?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(normalize_id(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    #[instrument(level = "debug", skip_all, fields(%source, %id))]
    async fn save(&self, source: &str, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(source)?;
        let tmp = self.dir.join(format!(".{}.tmp", file_name(source)?));
        fs::write(&tmp, id).await.map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(io_error(&path))?;
        debug!(path = %path.display(), "Persisted last announced id");
        Ok(())
    }
}

/// In-process backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryIdStore {
    ids: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl IdStore for MemoryIdStore {
    async fn load(&self, source: &str) -> Result<Option<String>, StoreError> {
        let ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        Ok(ids.get(source).cloned())
    }

    async fn save(&self, source: &str, id: &str) -> Result<(), StoreError> {
        let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        ids.insert(source.to_string(), id.to_string());
        Ok(())
    }
}

/// Decides whether a fetched id is new and records delivered ids.
///
/// Persisted ids are read once per source and cached; the cache is updated
/// only by [`DedupStore::commit`], which writes through to the backend first.
pub struct DedupStore {
    backend: Arc<dyn IdStore>,
    cache: tokio::sync::Mutex<HashMap<String, Option<String>>>,
}

impl DedupStore {
    pub fn new(backend: Arc<dyn IdStore>) -> Self {
        Self {
            backend,
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The id last committed for `source`, if any.
    pub async fn last_announced(&self, source: &str) -> Result<Option<String>, StoreError> {
        let mut cache = self.cache.lock().await;
        if let Some(id) = cache.get(source) {
            return Ok(id.clone());
        }
        let id = self.backend.load(source).await?;
        debug!(%source, last_id = ?id, "Loaded last announced id");
        cache.insert(source.to_string(), id.clone());
        Ok(id)
    }

    /// A candidate is new iff it differs from the last committed id and the
    /// source's queue has not already taken it in.
    pub async fn is_new(&self, source: &str, candidate: &str, queue: &PendingQueue) -> Result<bool, StoreError> {
        let Some(candidate) = normalize_id(candidate) else {
            return Ok(false);
        };
        if queue.has_seen(&candidate) {
            return Ok(false);
        }
        let last = self.last_announced(source).await?;
        Ok(last.as_deref() != Some(candidate.as_str()))
    }

    /// Record `id` as delivered for `source`.
    #[instrument(level = "info", skip_all, fields(%source, %id))]
    pub async fn commit(&self, source: &str, id: &str) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        self.backend.save(source, id).await?;
        cache.insert(source.to_string(), Some(id.to_string()));
        info!("Committed last announced id");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Item;

    fn item(id: &str) -> Item {
        Item::new(id, "t", "https://x.example").unwrap()
    }

    #[test]
    fn test_file_name_sanitized() {
        assert_eq!(file_name("rbc_crypto").unwrap(), "rbc_crypto");
        assert_eq!(file_name("../etc/passwd").unwrap(), "___etc_passwd");
        assert_eq!(file_name("ru.investing.com").unwrap(), "ru_investing_com");
        assert!(matches!(file_name("  "), Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdStore::new(dir.path());
        assert_eq!(store.load("rbc").await.unwrap(), None);

        store.save("rbc", "41").await.unwrap();
        store.save("rbc", "42").await.unwrap();
        assert_eq!(store.load("rbc").await.unwrap(), Some("42".to_string()));

        // No temp file left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["rbc".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_file_means_no_prior_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rbc"), " \n").unwrap();
        let store = FileIdStore::new(dir.path());
        assert_eq!(store.load("rbc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_fetch_is_new() {
        let dedup = DedupStore::new(Arc::new(MemoryIdStore::default()));
        assert!(dedup.is_new("rbc", "1", &PendingQueue::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_id_twice_is_not_new() {
        let dedup = DedupStore::new(Arc::new(MemoryIdStore::default()));
        let mut queue = PendingQueue::new();

        assert!(dedup.is_new("rbc", "42", &queue).await.unwrap());
        assert!(queue.enqueue(item("42")));
        assert!(!dedup.is_new("rbc", "42", &queue).await.unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_then_refetch_is_not_new() {
        let backend = Arc::new(MemoryIdStore::default());
        backend.save("rbc", "41").await.unwrap();
        let dedup = DedupStore::new(backend.clone());
        let queue = PendingQueue::new();

        assert!(!dedup.is_new("rbc", "41", &queue).await.unwrap());
        assert!(dedup.is_new("rbc", " 42 ", &queue).await.unwrap());
        dedup.commit("rbc", "42").await.unwrap();
        assert_eq!(backend.load("rbc").await.unwrap(), Some("42".to_string()));
        assert!(!dedup.is_new("rbc", "42", &queue).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncommitted_id_is_new_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = DedupStore::new(Arc::new(FileIdStore::new(dir.path())));
        let mut queue = PendingQueue::new();
        first.commit("rbc", "41").await.unwrap();
        assert!(first.is_new("rbc", "42", &queue).await.unwrap());
        queue.enqueue(item("42"));
        drop(first);

        // Process restarts before delivery: fresh cache, fresh queue.
        let second = DedupStore::new(Arc::new(FileIdStore::new(dir.path())));
        assert!(second.is_new("rbc", "42", &PendingQueue::new()).await.unwrap());
    }
}
