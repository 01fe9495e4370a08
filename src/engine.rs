//! Inference engine: session ownership, execution and mask extraction
//!
//! At most one session is live at a time. Loading a different variant drops
//! the previous session before the new weights are fetched.

use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceSession;
use crate::loader::{ModelLoader, ProgressSink, PROGRESS_READY};
use crate::models::ModelVariant;
use crate::types::{InferenceOutput, SegmentationMask};
use crate::utils::{tensor_to_mask, ImagePreprocessor};
use image::DynamicImage;
use tracing::{debug, info_span, instrument};

struct LoadedModel {
    variant: ModelVariant,
    session: Box<dyn InferenceSession>,
}

/// Owns the single live session and runs images through it
pub struct InferenceEngine {
    loader: ModelLoader,
    loaded: Option<LoadedModel>,
}

impl InferenceEngine {
    #[must_use]
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            loader,
            loaded: None,
        }
    }

    #[must_use]
    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    /// Variant of the live session, if any
    #[must_use]
    pub fn current_variant(&self) -> Option<ModelVariant> {
        self.loaded.as_ref().map(|m| m.variant)
    }

    /// Make `variant` the live session
    ///
    /// Returns immediately with progress 1.0 when it is already loaded.
    ///
    /// # Errors
    /// - `LoadNetwork` / `LoadConstruction` from the loader
    #[instrument(skip(self, progress))]
    pub async fn load(&mut self, variant: ModelVariant, progress: ProgressSink<'_>) -> Result<()> {
        if self.current_variant() == Some(variant) {
            progress(PROGRESS_READY);
            return Ok(());
        }

        if let Some(previous) = self.loaded.take() {
            debug!(previous = %previous.variant, "discarding previous session");
        }

        let session = self
            .loader
            .load_session(variant.descriptor(), progress)
            .await?;
        self.loaded = Some(LoadedModel { variant, session });
        Ok(())
    }

    /// Compute the mask for `image` with the live session
    ///
    /// Every failure is reported as `Inference`; the session stays usable.
    ///
    /// # Errors
    /// - `ModelNotLoaded` when no session exists
    /// - `Inference` for preprocessing, execution or postprocessing failures
    pub fn infer(&mut self, image: &DynamicImage) -> Result<InferenceOutput> {
        let loaded = self.loaded.as_mut().ok_or(BgRemovalError::ModelNotLoaded)?;
        let variant = loaded.variant;
        let descriptor = variant.descriptor();
        let _span = info_span!(
            "inference",
            model = descriptor.id,
            width = image.width(),
            height = image.height()
        )
        .entered();

        let start = instant::Instant::now();
        let mask = Self::run_pipeline(loaded.session.as_mut(), image, descriptor.input_resolution)
            .map_err(|e| match e {
                BgRemovalError::Inference(_) => e,
                other => BgRemovalError::inference(other.to_string()),
            })?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            foreground = mask.foreground_ratio(),
            "mask computed"
        );

        Ok(InferenceOutput { variant, mask })
    }

    fn run_pipeline(
        session: &mut dyn InferenceSession,
        image: &DynamicImage,
        resolution: u32,
    ) -> Result<SegmentationMask> {
        let (tensor, geometry) = ImagePreprocessor::preprocess(image, resolution)?;
        let output = session.run(&tensor)?;
        tensor_to_mask(&output, &geometry)
    }
}
