//! Single-slot durable store for the last fetched credential
//!
//! A corrupt record is a cache miss, never an error: `load` logs and
//! returns `None`. Writes are complete (flushed and renamed into place)
//! before `save` returns, so a process started right afterwards sees them.

use crate::protocol::CachedCredential;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cached record is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("Failed to serialize cache record: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Durable single-record credential store
pub trait ConfigCache: Send + Sync {
    /// Overwrite the stored record
    fn save(&self, record: &CachedCredential) -> Result<(), CacheError>;

    /// Read the stored record; missing or corrupt records yield `None`
    fn load(&self) -> Option<CachedCredential>;

    /// Remove the stored record (no-op when absent)
    fn delete(&self) -> Result<(), CacheError>;
}

/// JSON file backed cache
#[derive(Debug, Clone)]
pub struct FileConfigCache {
    path: PathBuf,
}

impl FileConfigCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn read_record(&self) -> Result<Option<CachedCredential>, CacheError> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(CacheError::Corrupt)
    }
}

impl ConfigCache for FileConfigCache {
    fn save(&self, record: &CachedCredential) -> Result<(), CacheError> {
        let json = serde_json::to_vec(record).map_err(CacheError::Serialize)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename keeps the slot either old or new, never torn.
        let temp_path = self.temp_path();
        {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;

        debug!(path = %self.path.display(), "Credential cache saved");
        Ok(())
    }

    fn load(&self) -> Option<CachedCredential> {
        match self.read_record() {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring unreadable credential cache: {}", e);
                None
            }
        }
    }

    fn delete(&self) -> Result<(), CacheError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Credential cache deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

/// Process-local cache, for tests and for hosts without writable storage
#[derive(Debug, Default)]
pub struct InMemoryConfigCache {
    slot: Mutex<Option<CachedCredential>>,
}

impl InMemoryConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CachedCredential) -> Self {
        Self {
            slot: Mutex::new(Some(record)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CachedCredential>> {
        // A poisoned slot still holds a whole record; keep using it.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConfigCache for InMemoryConfigCache {
    fn save(&self, record: &CachedCredential) -> Result<(), CacheError> {
        *self.slot() = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> Option<CachedCredential> {
        self.slot().clone()
    }

    fn delete(&self) -> Result<(), CacheError> {
        *self.slot() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Credential;

    fn record() -> CachedCredential {
        CachedCredential::new(Credential::new("hub", "token", 3600.0), 1_700_000_000_000)
    }

    #[test]
    fn test_file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileConfigCache::new(dir.path().join("nested").join("cred.json"));

        assert!(cache.load().is_none());
        cache.save(&record()).unwrap();
        assert_eq!(cache.load(), Some(record()));
        assert!(!cache.temp_path().exists());
    }

    #[test]
    fn test_file_cache_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileConfigCache::new(dir.path().join("cred.json"));

        cache.save(&record()).unwrap();
        let newer = CachedCredential::new(Credential::new("hub2", "t2", 60.0), 5);
        cache.save(&newer).unwrap();
        assert_eq!(cache.load(), Some(newer));
    }

    #[test]
    fn test_file_cache_corrupt_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.json");
        std::fs::write(&path, b"{not json").unwrap();

        let cache = FileConfigCache::new(&path);
        assert!(cache.load().is_none());
        assert!(matches!(cache.read_record(), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_file_cache_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileConfigCache::new(dir.path().join("cred.json"));

        cache.delete().unwrap();
        cache.save(&record()).unwrap();
        cache.delete().unwrap();
        assert!(cache.load().is_none());
        cache.delete().unwrap();
    }

    #[test]
    fn test_file_cache_reads_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.json");
        std::fs::write(
            &path,
            br#"{"config":{"iot_host":"h","sas_token":"t","expiry":30.0},"savedOnMs":42}"#,
        )
        .unwrap();

        let loaded = FileConfigCache::new(&path).load().unwrap();
        assert_eq!(loaded.credential.broker_host, "h");
        assert_eq!(loaded.fetched_at_ms, 42);
    }

    #[test]
    fn test_in_memory_cache() {
        let cache = InMemoryConfigCache::new();
        assert!(cache.load().is_none());
        cache.save(&record()).unwrap();
        assert_eq!(cache.load(), Some(record()));
        cache.delete().unwrap();
        assert!(cache.load().is_none());
    }
}
