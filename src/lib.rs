#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # rmbg-engine
//!
//! Background removal pipeline built around a single isolated inference
//! worker: model weights are fetched once and cached on disk, one session is
//! live at a time, and a batch driver walks a list of images through it in
//! order, reporting status, load progress and a reveal animation for the
//! image on display.
//!
//! ## Features
//!
//! - **Two model variants**: RMBG-1.4 (1024²) and U2Net (320²)
//! - **Two backends**: ONNX Runtime (CUDA / CoreML / CPU) and Tract (pure Rust)
//! - **Persistent model cache** with atomic writes and single-flight loading
//! - **Worker isolation**: a crashed worker rejects pending requests and is
//!   replaced on the next request
//! - **Batch state machine** with model switching and PNG / ZIP export
//! - **CLI driver** (`rmbg`, enable with the `cli` feature)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rmbg_engine::{
//!     remove_background, EngineConfig, ModelLoader, ModelVariant, ModelWorker,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let loader = ModelLoader::from_config(&EngineConfig::default())?;
//! let worker = ModelWorker::new(loader);
//!
//! let image = image::open("input.jpg")?;
//! let result = remove_background(&worker, image, ModelVariant::Rmbg).await?;
//! result.image.save("input-nobg.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature flags
//!
//! - `onnx` (default): ONNX Runtime backend
//! - `tract` (default): pure Rust backend
//! - `cli` (default): the `rmbg` binary and subscriber setup
//! - `webp-support` (default): WebP input decoding
//! - `tracing-json`: JSON log output for the CLI

pub mod backends;
pub mod batch;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod compositing;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod export;
pub mod inference;
pub mod loader;
pub mod models;
pub mod preference;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;
pub mod worker;

use std::sync::Arc;

pub use backends::{available_backends, session_factory};
pub use batch::{
    reveal_progress, BatchJob, BatchObserver, BatchProcessor, BatchSummary, DisplayedImage,
    JobStatus, MaskProvider, NoOpObserver, SwitchOutcome,
};
pub use cache::{CachedModelInfo, MemoryModelStore, ModelCache, ModelStore, CACHE_DIR_ENV};
pub use compositing::{apply_mask, composite_over, parse_hex_color, Background};
pub use config::{BackendType, BatchConfig, EngineConfig, EngineConfigBuilder, ExecutionProvider};
pub use download::{validate_model_url, HttpFetcher, ModelFetcher};
pub use engine::InferenceEngine;
pub use error::{BgRemovalError, LoadFailure, LoadFailureKind, Result};
pub use export::{export_images, output_file_name, ExportArtifact, ARCHIVE_NAME};
pub use inference::{InferenceSession, SessionFactory};
pub use loader::ModelLoader;
pub use models::{ModelDescriptor, ModelVariant};
pub use preference::ModelPreference;
pub use types::{InferenceOutput, ProcessedImage, SegmentationMask};
pub use worker::{ModelWorker, ProgressCallback, WorkerEvent, WorkerRequest};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat};

/// Remove the background of one image
///
/// Loads `variant` in the worker if needed, computes the mask and returns
/// the cut-out: source RGB with the mask as alpha.
///
/// # Errors
/// - Load failures (`LoadNetwork`, `LoadConstruction`, `WorkerFault`)
/// - `Inference` / `InferenceBusy` from the worker
pub async fn remove_background(
    worker: &ModelWorker,
    image: image::DynamicImage,
    variant: ModelVariant,
) -> Result<ProcessedImage> {
    let image = Arc::new(image);
    let output = worker.process_image(Arc::clone(&image), variant).await?;
    let cutout = apply_mask(&image.to_rgba8(), &output.mask)?;
    Ok(ProcessedImage {
        image: cutout,
        variant: output.variant,
    })
}

/// Decode `image_bytes` and remove the background
///
/// # Errors
/// - Image decoding failure
/// - Any error of [`remove_background`]
pub async fn remove_background_from_bytes(
    worker: &ModelWorker,
    image_bytes: &[u8],
    variant: ModelVariant,
) -> Result<ProcessedImage> {
    let image = image::load_from_memory(image_bytes)?;
    remove_background(worker, image, variant).await
}
