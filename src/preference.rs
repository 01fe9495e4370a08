//! Persisted model selection
//!
//! The last selected variant survives restarts as a small JSON document in
//! the user config directory. A missing or unreadable file yields the default
//! variant; a failed write only logs a warning.

use crate::error::{BgRemovalError, Result};
use crate::models::ModelVariant;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct PreferenceDocument {
    selected_model: ModelVariant,
}

/// File-backed store of the selected variant
#[derive(Debug, Clone)]
pub struct ModelPreference {
    path: PathBuf,
}

impl ModelPreference {
    /// Store at `<config dir>/rmbg-engine/preferences.json`
    ///
    /// # Errors
    /// - No config directory on this platform
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir().ok_or_else(|| {
            BgRemovalError::invalid_config("Failed to determine config directory")
        })?;
        Ok(Self::with_path(dir.join("rmbg-engine").join(PREFERENCES_FILE)))
    }

    #[must_use]
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored variant, or the default when nothing usable is stored
    #[must_use]
    pub fn load(&self) -> ModelVariant {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<PreferenceDocument>(&text) {
                Ok(doc) => doc.selected_model,
                Err(e) => {
                    log::warn!(
                        "Ignoring unreadable preference file {}: {}",
                        self.path.display(),
                        e
                    );
                    ModelVariant::default()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ModelVariant::default(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", self.path.display(), e);
                ModelVariant::default()
            },
        }
    }

    /// Persist `variant`; failures are logged, never returned
    pub fn store(&self, variant: ModelVariant) {
        if let Err(e) = self.try_store(variant) {
            log::warn!("Failed to persist model selection: {}", e);
        }
    }

    fn try_store(&self, variant: ModelVariant) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create config directory", parent, &e))?;
        }
        let doc = PreferenceDocument {
            selected_model: variant,
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| BgRemovalError::internal(format!("Failed to serialize preference: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| BgRemovalError::file_io_error("write preference", &self.path, &e))?;
        log::debug!("Stored model selection {} in {}", variant, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_default() {
        let temp = TempDir::new().unwrap();
        let pref = ModelPreference::with_path(temp.path().join("none.json"));
        assert_eq!(pref.load(), ModelVariant::U2net);
    }

    #[test]
    fn test_store_then_load() {
        let temp = TempDir::new().unwrap();
        let pref = ModelPreference::with_path(temp.path().join("nested").join(PREFERENCES_FILE));
        pref.store(ModelVariant::Rmbg);
        assert_eq!(pref.load(), ModelVariant::Rmbg);

        let text = std::fs::read_to_string(pref.path()).unwrap();
        assert!(text.contains("\"rmbg\""));
    }

    #[test]
    fn test_corrupt_file_yields_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(PREFERENCES_FILE);
        std::fs::write(&path, "{ selected_model: 7").unwrap();
        assert_eq!(ModelPreference::with_path(path).load(), ModelVariant::default());
    }

    #[test]
    fn test_unknown_variant_yields_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(PREFERENCES_FILE);
        std::fs::write(&path, r#"{"selected_model":"sam"}"#).unwrap();
        assert_eq!(ModelPreference::with_path(path).load(), ModelVariant::U2net);
    }

    #[test]
    fn test_store_failure_is_silent() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // parent is a regular file, so the directory cannot be created
        let pref = ModelPreference::with_path(blocker.join(PREFERENCES_FILE));
        pref.store(ModelVariant::Rmbg);
        assert_eq!(pref.load(), ModelVariant::U2net);
    }
}
