//! Error types for model loading, inference and batch export

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Error taxonomy shared by the loader, the worker facade and the batch driver
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Model weights could not be fetched (transport failure or non-success status)
    #[error("Model download failed: {0}")]
    LoadNetwork(String),

    /// An inference session could not be built from the fetched weights
    #[error("Model construction failed: {0}")]
    LoadConstruction(String),

    /// Failure during preprocessing, session execution or postprocessing
    #[error("Inference error: {0}")]
    Inference(String),

    /// The isolated worker context terminated unexpectedly
    #[error("Worker execution error: {0}")]
    WorkerFault(String),

    /// A second inference was issued while one is still outstanding
    #[error("Inference already in progress")]
    InferenceBusy,

    /// Inference was requested before any model was loaded
    #[error("No model loaded")]
    ModelNotLoaded,

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persistent model cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Export (PNG encoding or archive writing) errors
    #[error("Export error: {0}")]
    Export(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgRemovalError {
    /// Create a new network load error
    pub fn load_network<S: Into<String>>(msg: S) -> Self {
        Self::LoadNetwork(msg.into())
    }

    /// Create a new session construction error
    pub fn load_construction<S: Into<String>>(msg: S) -> Self {
        Self::LoadConstruction(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new worker fault error
    pub fn worker_fault<S: Into<String>>(msg: S) -> Self {
        Self::WorkerFault(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new cache error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a new export error
    pub fn export<S: Into<String>>(msg: S) -> Self {
        Self::Export(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range})"
        ))
    }

    /// True for the two load failure kinds a caller may retry
    #[must_use]
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::LoadNetwork(_) | Self::LoadConstruction(_))
    }
}

/// Which stage of a model load failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureKind {
    Network,
    Construction,
    Worker,
}

/// Cloneable load outcome fanned out to every waiter of a single in-flight load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub kind: LoadFailureKind,
    pub message: String,
}

impl LoadFailure {
    pub fn new<S: Into<String>>(kind: LoadFailureKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&BgRemovalError> for LoadFailure {
    fn from(error: &BgRemovalError) -> Self {
        match error {
            BgRemovalError::LoadNetwork(msg) => Self::new(LoadFailureKind::Network, msg.clone()),
            BgRemovalError::WorkerFault(msg) => Self::new(LoadFailureKind::Worker, msg.clone()),
            BgRemovalError::LoadConstruction(msg) => {
                Self::new(LoadFailureKind::Construction, msg.clone())
            },
            other => Self::new(LoadFailureKind::Construction, other.to_string()),
        }
    }
}

impl From<LoadFailure> for BgRemovalError {
    fn from(failure: LoadFailure) -> Self {
        match failure.kind {
            LoadFailureKind::Network => Self::LoadNetwork(failure.message),
            LoadFailureKind::Construction => Self::LoadConstruction(failure.message),
            LoadFailureKind::Worker => Self::WorkerFault(failure.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BgRemovalError::load_network("HTTP 404");
        assert!(matches!(err, BgRemovalError::LoadNetwork(_)));
        assert_eq!(err.to_string(), "Model download failed: HTTP 404");

        let err = BgRemovalError::worker_fault("panicked");
        assert!(err.to_string().starts_with("Worker execution error"));

        let err = BgRemovalError::config_value_error("intra_threads", 99, "0-64");
        assert!(err.to_string().contains("valid range: 0-64"));
    }

    #[test]
    fn test_load_failure_roundtrip_preserves_kind() {
        let original = BgRemovalError::load_construction("bad protobuf");
        let failure = LoadFailure::from(&original);
        assert_eq!(failure.kind, LoadFailureKind::Construction);

        let restored: BgRemovalError = failure.into();
        assert!(matches!(restored, BgRemovalError::LoadConstruction(ref m) if m == "bad protobuf"));
        assert!(restored.is_load_failure());
    }

    #[test]
    fn test_inference_errors_are_not_load_failures() {
        assert!(!BgRemovalError::inference("shape").is_load_failure());
        assert!(!BgRemovalError::InferenceBusy.is_load_failure());
    }
}
