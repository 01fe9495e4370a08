//! Streaming HTTP download of model weights
//!
//! A plain GET against the model's source URL. The body is read in chunks so
//! the loader can report byte-proportional progress when the server declares
//! a content length.

use crate::error::{BgRemovalError, Result};
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_util::io::StreamReader;

/// Chunk callback: bytes received so far and the declared total, if any
pub type ChunkProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Source of model weight bytes
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Fetch the complete body at `url`
    ///
    /// # Errors
    /// - Transport failures and non-success statuses, as `LoadNetwork`
    async fn fetch(&self, url: &str, on_chunk: ChunkProgress<'_>) -> Result<Vec<u8>>;
}

/// `reqwest`-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with a 5 minute timeout
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(300))
    }

    /// # Errors
    /// - Failed to create HTTP client
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BgRemovalError::load_network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, on_chunk: ChunkProgress<'_>) -> Result<Vec<u8>> {
        validate_model_url(url)?;
        log::info!("Downloading model from: {url}");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BgRemovalError::load_network(format!("Failed to download {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(BgRemovalError::load_network(format!(
                "HTTP error {} for {url}",
                response.status()
            )));
        }

        let total_size = response.content_length();
        let mut body = Vec::with_capacity(
            total_size
                .and_then(|t| usize::try_from(t).ok())
                .unwrap_or(0),
        );

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut buffer = vec![0; 64 * 1024];
        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| {
                    BgRemovalError::load_network(format!("Failed to read download stream: {e}"))
                })?;

            if bytes_read == 0 {
                break;
            }

            body.extend_from_slice(buffer.get(..bytes_read).unwrap_or(&[]));
            on_chunk(body.len() as u64, total_size);
        }

        log::debug!("Downloaded {} bytes from {url}", body.len());
        Ok(body)
    }
}

/// Validate that a model URL is an absolute http(s) URL
///
/// # Errors
/// - Empty URL or unsupported scheme
pub fn validate_model_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(BgRemovalError::invalid_config("Model URL cannot be empty"));
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            BgRemovalError::invalid_config(format!(
                "Unsupported URL format: {url}. Expected an http(s) URL"
            ))
        })?;

    if rest.is_empty() || rest.starts_with('/') {
        return Err(BgRemovalError::invalid_config(format!(
            "Model URL has no host: {url}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_model_url() {
        assert!(validate_model_url("https://cdn.isboyjc.com/models/u2net/u2net.onnx").is_ok());
        assert!(validate_model_url("http://localhost:8080/model.onnx").is_ok());
        assert!(validate_model_url("").is_err());
        assert!(validate_model_url("ftp://example.com/model.onnx").is_err());
        assert!(validate_model_url("https:///model.onnx").is_err());
    }

    #[test]
    fn test_fetcher_creation() {
        assert!(HttpFetcher::new().is_ok());
        assert!(HttpFetcher::with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_request() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch("not-a-url", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::InvalidConfig(_)));
    }
}
