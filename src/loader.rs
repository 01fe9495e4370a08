//! Model acquisition: persistent cache first, network second
//!
//! Progress is reported as a fraction in [0, 1] at fixed milestones:
//!
//! | stage                         | cache hit | network        |
//! |-------------------------------|-----------|----------------|
//! | lookup / request started      | 0.3       | 0.1            |
//! | body streaming (length known) |           | 0.1 ..= 0.7    |
//! | bytes complete                | 0.8       | 0.75, then 0.8 |
//! | session construction started  | 0.85      | 0.85           |
//! | session ready                 | 1.0       | 1.0            |
//!
//! Cache read and write failures are logged and never fail a load.

use crate::cache::{MemoryModelStore, ModelCache, ModelStore};
use crate::config::EngineConfig;
use crate::download::{HttpFetcher, ModelFetcher};
use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceSession, SessionFactory};
use crate::models::ModelDescriptor;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const PROGRESS_CACHE_HIT: f32 = 0.3;
pub const PROGRESS_DOWNLOAD_START: f32 = 0.1;
pub const PROGRESS_DOWNLOAD_SPAN: f32 = 0.6;
pub const PROGRESS_DOWNLOAD_DONE: f32 = 0.75;
pub const PROGRESS_BYTES_READY: f32 = 0.8;
pub const PROGRESS_CONSTRUCTING: f32 = 0.85;
pub const PROGRESS_READY: f32 = 1.0;

/// Progress sink used throughout a load
pub type ProgressSink<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Fetches model weights and turns them into sessions
#[derive(Clone)]
pub struct ModelLoader {
    store: Arc<dyn ModelStore>,
    fetcher: Arc<dyn ModelFetcher>,
    factory: Arc<dyn SessionFactory>,
}

impl ModelLoader {
    pub fn new(
        store: Arc<dyn ModelStore>,
        fetcher: Arc<dyn ModelFetcher>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            store,
            fetcher,
            factory,
        }
    }

    /// Loader wired to the filesystem cache, HTTP and the configured backend
    ///
    /// With `disable_cache` the store is in-memory only, so nothing is persisted.
    ///
    /// # Errors
    /// - Cache directory cannot be created
    /// - HTTP client construction failure
    /// - Configured backend not compiled in
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store: Arc<dyn ModelStore> = if config.disable_cache {
            Arc::new(MemoryModelStore::new())
        } else if let Some(dir) = &config.cache_dir {
            Arc::new(ModelCache::with_dir(dir)?)
        } else {
            Arc::new(ModelCache::new()?)
        };
        let fetcher = Arc::new(HttpFetcher::with_timeout(config.download_timeout())?);
        let factory = crate::backends::session_factory(config)?;
        Ok(Self::new(store, fetcher, factory))
    }

    /// Whether the persistent store already holds the weights for `descriptor`
    pub async fn is_cached(&self, descriptor: &ModelDescriptor) -> bool {
        match self.store.contains(descriptor.source_url).await {
            Ok(present) => present,
            Err(e) => {
                warn!(model = descriptor.id, error = %e, "cache presence check failed");
                false
            },
        }
    }

    /// Obtain the raw weights, preferring the cache
    ///
    /// # Errors
    /// - `LoadNetwork` when the cache misses and the download fails
    #[instrument(skip(self, descriptor, progress), fields(model = descriptor.id))]
    pub async fn fetch_weights(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressSink<'_>,
    ) -> Result<Vec<u8>> {
        let url = descriptor.source_url;

        match self.store.read(url).await {
            Ok(Some(bytes)) => {
                info!(bytes = bytes.len(), "model weights served from cache");
                progress(PROGRESS_CACHE_HIT);
                progress(PROGRESS_BYTES_READY);
                return Ok(bytes);
            },
            Ok(None) => {},
            Err(e) => warn!(error = %e, "cache read failed, falling back to network"),
        }

        progress(PROGRESS_DOWNLOAD_START);
        let on_chunk = |received: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let fraction = (received as f64 / total as f64).min(1.0) as f32;
                progress(PROGRESS_DOWNLOAD_START + PROGRESS_DOWNLOAD_SPAN * fraction);
            }
        };
        let bytes = self
            .fetcher
            .fetch(url, &on_chunk)
            .await
            .map_err(|e| match e {
                BgRemovalError::LoadNetwork(_) => e,
                other => BgRemovalError::load_network(other.to_string()),
            })?;
        progress(PROGRESS_DOWNLOAD_DONE);

        if let Err(e) = self.store.write(url, &bytes).await {
            warn!(error = %e, "failed to write model weights to cache");
        }
        progress(PROGRESS_BYTES_READY);

        Ok(bytes)
    }

    /// Fetch weights and construct a ready session
    ///
    /// # Errors
    /// - `LoadNetwork` when the weights cannot be obtained
    /// - `LoadConstruction` when the backend rejects them
    #[instrument(skip(self, descriptor, progress), fields(model = descriptor.id))]
    pub async fn load_session(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressSink<'_>,
    ) -> Result<Box<dyn InferenceSession>> {
        let weights = self.fetch_weights(descriptor, progress).await?;

        progress(PROGRESS_CONSTRUCTING);
        let start = instant::Instant::now();
        let session = self
            .factory
            .create(descriptor, &weights)
            .map_err(|e| match e {
                BgRemovalError::LoadConstruction(_) => e,
                other => BgRemovalError::load_construction(other.to_string()),
            })?;
        info!(
            backend = session.backend_name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inference session constructed"
        );
        progress(PROGRESS_READY);

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{BrokenStore, MockFetcher, MockSessionFactory};
    use crate::models::ModelVariant;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<f32>>>, impl Fn(f32) + Send + Sync) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&values);
        (values, move |p| sink.lock().unwrap().push(p))
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let descriptor = ModelVariant::U2net.descriptor();
        let store = Arc::new(MemoryModelStore::new().with_entry(descriptor.source_url, vec![7; 32]));
        let fetcher = Arc::new(MockFetcher::new(vec![1; 8]));
        let loader = ModelLoader::new(store, fetcher.clone(), Arc::new(MockSessionFactory::new()));

        let (values, sink) = recorder();
        loader.load_session(descriptor, &sink).await.unwrap();

        assert_eq!(fetcher.fetch_count(), 0);
        assert_eq!(*values.lock().unwrap(), vec![0.3, 0.8, 0.85, 1.0]);
    }

    #[tokio::test]
    async fn test_network_path_reports_proportional_progress_and_caches() {
        let descriptor = ModelVariant::Rmbg.descriptor();
        let store = Arc::new(MemoryModelStore::new());
        let fetcher = Arc::new(MockFetcher::new(vec![0; 100]));
        let loader = ModelLoader::new(store.clone(), fetcher, Arc::new(MockSessionFactory::new()));

        let (values, sink) = recorder();
        let bytes = loader.fetch_weights(descriptor, &sink).await.unwrap();

        assert_eq!(bytes.len(), 100);
        assert_eq!(store.write_count(), 1);
        let values = values.lock().unwrap().clone();
        assert_eq!(values.len(), 5);
        assert!((values[1] - 0.4).abs() < 1e-6);
        assert!((values[2] - 0.7).abs() < 1e-6);
        assert_eq!(values[3], 0.75);
        assert_eq!(values[4], 0.8);
    }

    #[tokio::test]
    async fn test_unknown_length_skips_chunk_progress() {
        let loader = ModelLoader::new(
            Arc::new(MemoryModelStore::new()),
            Arc::new(MockFetcher::new(vec![0; 10]).without_length()),
            Arc::new(MockSessionFactory::new()),
        );
        let (values, sink) = recorder();
        loader
            .fetch_weights(ModelVariant::U2net.descriptor(), &sink)
            .await
            .unwrap();
        assert_eq!(*values.lock().unwrap(), vec![0.1, 0.75, 0.8]);
    }

    #[tokio::test]
    async fn test_network_failure_is_load_network() {
        let loader = ModelLoader::new(
            Arc::new(MemoryModelStore::new()),
            Arc::new(MockFetcher::failing()),
            Arc::new(MockSessionFactory::new()),
        );
        let err = loader
            .load_session(ModelVariant::U2net.descriptor(), &|_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BgRemovalError::LoadNetwork(_)));
    }

    #[tokio::test]
    async fn test_construction_failure_is_load_construction() {
        let loader = ModelLoader::new(
            Arc::new(MemoryModelStore::new()),
            Arc::new(MockFetcher::new(vec![1, 2, 3])),
            Arc::new(MockSessionFactory::failing_construction()),
        );
        let err = loader
            .load_session(ModelVariant::U2net.descriptor(), &|_| {})
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BgRemovalError::LoadConstruction(_)));
    }

    #[tokio::test]
    async fn test_broken_cache_falls_back_to_network() {
        let descriptor = ModelVariant::U2net.descriptor();
        let store = Arc::new(BrokenStore::default());
        let fetcher = Arc::new(MockFetcher::new(vec![0; 100]));
        let factory = Arc::new(MockSessionFactory::new());
        let loader = ModelLoader::new(store.clone(), fetcher.clone(), factory.clone());

        assert!(!loader.is_cached(descriptor).await);

        let (values, sink) = recorder();
        let session = loader.load_session(descriptor, &sink).await.unwrap();
        assert_eq!(session.backend_name(), "mock");

        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.write_count(), 1);
        assert_eq!(factory.created_count(), 1);

        let values = values.lock().unwrap().clone();
        assert_eq!(values.first(), Some(&0.1));
        assert_eq!(values[values.len() - 4..], [0.75, 0.8, 0.85, 1.0]);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_is_cached() {
        let descriptor = ModelVariant::U2net.descriptor();
        let loader = ModelLoader::new(
            Arc::new(MemoryModelStore::new().with_entry(descriptor.source_url, vec![1])),
            Arc::new(MockFetcher::new(Vec::new())),
            Arc::new(MockSessionFactory::new()),
        );
        assert!(loader.is_cached(descriptor).await);
        assert!(!loader.is_cached(ModelVariant::Rmbg.descriptor()).await);
    }
}
