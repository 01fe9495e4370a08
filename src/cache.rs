//! Persistent model weight cache
//!
//! Entries are keyed by the model's download URL and hold the raw weight
//! bytes. The filesystem store lives in an XDG-style cache directory:
//! - Linux/macOS: `~/.cache/rmbg-engine/models/`
//! - Windows: `%LOCALAPPDATA%/rmbg-engine/models/`
//!
//! Each entry is two files named after a hash of the URL: `<id>.onnx` with the
//! weights and `<id>.url` recording which URL produced them.

use crate::error::{BgRemovalError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "RMBG_ENGINE_CACHE_DIR";

/// Key/value store for model weights, keyed by source URL
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Whether an entry exists for `key`
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Read the bytes stored under `key`, `None` on a miss
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `key`, replacing any previous entry
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Information about a cached model file
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// Cache-safe identifier derived from the URL
    pub model_id: String,
    /// Source URL, when the sidecar file is readable
    pub source_url: Option<String>,
    /// Path to the weight file
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Filesystem-backed model store
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache rooted at the default location
    ///
    /// # Errors
    /// - Failed to determine cache directory
    /// - Failed to create cache directory
    pub fn new() -> Result<Self> {
        Self::with_dir(Self::default_cache_dir()?)
    }

    /// Create a cache rooted at `cache_dir`, creating it if needed
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn with_dir<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir).map_err(|e| {
                BgRemovalError::file_io_error("create cache directory", &cache_dir, &e)
            })?;
        }
        Ok(Self { cache_dir })
    }

    /// Resolve the cache directory: env override first, then the user cache dir
    ///
    /// # Errors
    /// - No user cache directory could be determined
    pub fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                BgRemovalError::invalid_config(format!(
                    "Failed to determine cache directory. Set {CACHE_DIR_ENV} environment variable."
                ))
            })?
            .join("rmbg-engine")
            .join("models"))
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Generate a filesystem-safe identifier from a URL
    ///
    /// ```
    /// use rmbg_engine::cache::ModelCache;
    ///
    /// let id = ModelCache::url_to_model_id("https://cdn.isboyjc.com/models/u2net/u2net.onnx");
    /// assert!(id.starts_with("url-"));
    /// assert_eq!(id.len(), 20);
    /// ```
    #[must_use]
    pub fn url_to_model_id(url: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let hash_string = format!("url-{:x}", hasher.finalize());
        hash_string.get(..20).unwrap_or(&hash_string).to_string()
    }

    /// Path of the weight file for `url` (may not exist)
    #[must_use]
    pub fn model_path(&self, url: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.onnx", Self::url_to_model_id(url)))
    }

    fn sidecar_path(&self, url: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.url", Self::url_to_model_id(url)))
    }

    /// Scan the cache directory for stored weight files
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(models);
        }

        let entries = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            BgRemovalError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                BgRemovalError::file_io_error("read cache entry in", &self.cache_dir, &e)
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("onnx") {
                continue;
            }
            let Some(model_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let source_url = std::fs::read_to_string(path.with_extension("url"))
                .ok()
                .map(|s| s.trim().to_string());
            models.push(CachedModelInfo {
                model_id,
                source_url,
                path,
                size_bytes,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove the entry for `url`; returns whether anything was deleted
    ///
    /// # Errors
    /// - Failed to delete an existing file
    pub fn clear_model(&self, url: &str) -> Result<bool> {
        let path = self.model_path(url);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| BgRemovalError::file_io_error("remove cached model", &path, &e))?;
        let sidecar = self.sidecar_path(url);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)
                .map_err(|e| BgRemovalError::file_io_error("remove cache sidecar", &sidecar, &e))?;
        }
        log::info!("Removed cached model {}", path.display());
        Ok(true)
    }

    /// Remove every entry; returns the number of weight files deleted
    ///
    /// # Errors
    /// - Failed to read the cache directory or delete a file
    pub fn clear_all_models(&self) -> Result<usize> {
        let models = self.scan_cached_models()?;
        for model in &models {
            std::fs::remove_file(&model.path).map_err(|e| {
                BgRemovalError::file_io_error("remove cached model", &model.path, &e)
            })?;
            let sidecar = model.path.with_extension("url");
            if sidecar.exists() {
                std::fs::remove_file(&sidecar).map_err(|e| {
                    BgRemovalError::file_io_error("remove cache sidecar", &sidecar, &e)
                })?;
            }
        }
        log::info!("Cleared {} cached model(s)", models.len());
        Ok(models.len())
    }

    /// Human readable byte count
    #[must_use]
    pub fn format_size(bytes: u64) -> String {
        const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
        let mut size = bytes as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{bytes} B")
        } else {
            format!("{size:.1} {}", UNITS.get(unit).unwrap_or(&"B"))
        }
    }
}

#[async_trait]
impl ModelStore for ModelCache {
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.model_path(key)).await?)
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.model_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                log::debug!("Cache hit for {key} ({} bytes)", bytes.len());
                Ok(Some(bytes))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BgRemovalError::file_io_error("read cached model", &path, &e)),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.model_path(key);
        // Partial files must never be visible under the final name
        let tmp = path.with_extension("onnx.part");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| BgRemovalError::file_io_error("write cache file", &tmp, &e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("finalize cache file", &path, &e))?;
        let sidecar = self.sidecar_path(key);
        tokio::fs::write(&sidecar, key)
            .await
            .map_err(|e| BgRemovalError::file_io_error("write cache sidecar", &sidecar, &e))?;
        log::debug!("Cached {} bytes for {key} at {}", bytes.len(), path.display());
        Ok(())
    }
}

/// In-process store; also used when the persistent cache is disabled
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryModelStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry without counting it as a write
    #[must_use]
    pub fn with_entry<S: Into<String>>(self, key: S, bytes: Vec<u8>) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), bytes);
        }
        self
    }

    /// Number of `write` calls observed
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `read` calls observed
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| BgRemovalError::cache("memory store lock poisoned"))
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock()?.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const URL: &str = "https://cdn.isboyjc.com/models/u2net/u2net.onnx";

    #[test]
    fn test_url_to_model_id_is_stable() {
        let a = ModelCache::url_to_model_id(URL);
        let b = ModelCache::url_to_model_id(URL);
        assert_eq!(a, b);
        assert_ne!(a, ModelCache::url_to_model_id("https://example.com/other.onnx"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[tokio::test]
    async fn test_filesystem_roundtrip() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_dir(temp.path().join("models")).unwrap();

        assert!(!cache.contains(URL).await.unwrap());
        assert!(cache.read(URL).await.unwrap().is_none());

        cache.write(URL, b"weights").await.unwrap();
        assert!(cache.contains(URL).await.unwrap());
        assert_eq!(cache.read(URL).await.unwrap().as_deref(), Some(&b"weights"[..]));

        let listed = cache.scan_cached_models().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].source_url.as_deref(), Some(URL));
        assert_eq!(listed[0].size_bytes, 7);
    }

    #[tokio::test]
    async fn test_clear_models() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_dir(temp.path()).unwrap();
        cache.write(URL, b"a").await.unwrap();
        cache.write("https://example.com/b.onnx", b"b").await.unwrap();

        assert!(cache.clear_model(URL).unwrap());
        assert!(!cache.clear_model(URL).unwrap());
        assert_eq!(cache.clear_all_models().unwrap(), 1);
        assert!(cache.scan_cached_models().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_counts() {
        let store = MemoryModelStore::new().with_entry(URL, vec![1, 2, 3]);
        assert!(store.contains(URL).await.unwrap());
        assert_eq!(store.read(URL).await.unwrap(), Some(vec![1, 2, 3]));
        store.write("k", &[9]).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(ModelCache::format_size(512), "512 B");
        assert_eq!(ModelCache::format_size(2048), "2.0 KB");
        assert_eq!(ModelCache::format_size(176 * 1024 * 1024), "176.0 MB");
    }
}
