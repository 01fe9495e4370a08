//! Session backends
//!
//! - ONNX Runtime (hardware acceleration via CUDA / CoreML)
//! - Tract (pure Rust, CPU only)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(test)]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxSessionFactory;

#[cfg(feature = "tract")]
pub use self::tract::TractSessionFactory;

use crate::config::{BackendType, EngineConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::SessionFactory;
use std::sync::Arc;

/// Create the session factory selected by `config.backend`
///
/// # Errors
/// - The requested backend was not compiled in
pub fn session_factory(config: &EngineConfig) -> Result<Arc<dyn SessionFactory>> {
    match config.backend {
        #[cfg(feature = "onnx")]
        BackendType::Onnx => Ok(Arc::new(OnnxSessionFactory::new(config))),
        #[cfg(feature = "tract")]
        BackendType::Tract => Ok(Arc::new(TractSessionFactory::new())),
        #[allow(unreachable_patterns)]
        other => Err(BgRemovalError::invalid_config(format!(
            "Backend '{other}' is not enabled in this build"
        ))),
    }
}

/// Backends compiled into this build
#[must_use]
pub fn available_backends() -> Vec<BackendType> {
    let mut backends = Vec::new();
    if cfg!(feature = "onnx") {
        backends.push(BackendType::Onnx);
    }
    if cfg!(feature = "tract") {
        backends.push(BackendType::Tract);
    }
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backend_is_available() {
        let config = EngineConfig::default();
        assert!(available_backends().contains(&config.backend));
        assert!(session_factory(&config).is_ok());
    }
}
