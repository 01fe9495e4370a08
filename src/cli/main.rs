//! Background removal CLI
//!
//! Decodes the inputs, runs them through the batch driver on one worker and
//! writes `<stem>-nobg.png` files (or a single archive).

use crate::{
    batch::{BatchJob, BatchObserver, BatchProcessor, JobStatus},
    cache::ModelCache,
    compositing::{composite_over, Background},
    config::{BackendType, BatchConfig, EngineConfig, ExecutionProvider},
    export::{encode_png, export_images, ExportArtifact},
    loader::ModelLoader,
    models::{descriptors, ModelVariant},
    preference::ModelPreference,
    tracing_config::init_cli_tracing,
    worker::ModelWorker,
};
use anyhow::{Context, Result};
use clap::Parser;
use image::{DynamicImage, RgbaImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "tiff", "tif"];

/// Remove image backgrounds with RMBG-1.4 or U2Net
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "rmbg")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input images or directories
    #[arg(value_name = "INPUT", required_unless_present_any = &["list_models", "clear_cache", "show_cache_dir"])]
    pub input: Vec<PathBuf>,

    /// Output directory [default: current directory]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Model variant (rmbg, u2net) [default: last used, else u2net]
    #[arg(short, long)]
    pub model: Option<ModelVariant>,

    /// Inference backend (onnx, tract)
    #[arg(short, long, default_value_t = BackendType::default())]
    pub backend: BackendType,

    /// Execution provider for the onnx backend (auto, cpu, cuda, coreml)
    #[arg(short, long, default_value_t = ExecutionProvider::Auto)]
    pub execution_provider: ExecutionProvider,

    /// Intra-op threads (0 = let the backend decide)
    #[arg(short, long, default_value_t = 1)]
    pub threads: usize,

    /// Also write `<stem>-preview.png` flattened onto "transparent"
    /// (checkerboard) or a hex color such as #ffffff; the `-nobg.png`
    /// output keeps its alpha either way
    #[arg(long, value_name = "BACKGROUND")]
    pub preview_background: Option<Background>,

    /// Bundle all results into one ZIP archive
    #[arg(long)]
    pub archive: bool,

    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Verbose logging (-v: debug, -vv: trace, -vvv: trace for dependencies too)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List known models and their cache status, then exit
    #[arg(long)]
    pub list_models: bool,

    /// Clear cached weights (combine with --model to clear one variant)
    #[arg(long)]
    pub clear_cache: bool,

    /// Show the model cache directory, then exit
    #[arg(long)]
    pub show_cache_dir: bool,

    /// Use a custom model cache directory
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Never read or write the model cache
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    if cli.list_models {
        return list_models(&cli);
    }
    if cli.clear_cache {
        return clear_cache(&cli);
    }
    if cli.show_cache_dir {
        return show_cache_dir(&cli);
    }
    if cli.input.is_empty() {
        anyhow::bail!("At least one input is required");
    }

    run(cli).await
}

fn open_cache(cli: &Cli) -> Result<ModelCache> {
    match &cli.cache_dir {
        Some(dir) => ModelCache::with_dir(dir).context("Failed to open custom cache directory"),
        None => ModelCache::new().context("Failed to open model cache"),
    }
}

fn list_models(cli: &Cli) -> Result<()> {
    let cache = open_cache(cli)?;

    println!("Models");
    for descriptor in descriptors() {
        let path = cache.model_path(descriptor.source_url);
        let status = match std::fs::metadata(&path) {
            Ok(meta) => format!("cached, {}", ModelCache::format_size(meta.len())),
            Err(_) => "not cached".to_string(),
        };
        println!(
            "  {:<6} {:<9} {}x{}  ({})",
            descriptor.id,
            descriptor.display_name,
            descriptor.input_resolution,
            descriptor.input_resolution,
            status
        );
    }

    let known: Vec<String> = descriptors()
        .map(|d| ModelCache::url_to_model_id(d.source_url))
        .collect();
    let others: Vec<_> = cache
        .scan_cached_models()
        .context("Failed to scan model cache")?
        .into_iter()
        .filter(|m| !known.contains(&m.model_id))
        .collect();
    if !others.is_empty() {
        println!("\nOther cache entries");
        for model in others {
            println!(
                "  {} {} ({})",
                model.model_id,
                model.source_url.as_deref().unwrap_or("unknown source"),
                ModelCache::format_size(model.size_bytes)
            );
        }
    }

    println!("\nCache directory: {}", cache.cache_dir().display());
    Ok(())
}

fn clear_cache(cli: &Cli) -> Result<()> {
    let cache = open_cache(cli)?;

    if let Some(variant) = cli.model {
        if cache
            .clear_model(variant.descriptor().source_url)
            .with_context(|| format!("Failed to clear {variant}"))?
        {
            println!("Removed cached weights for {variant}");
        } else {
            println!("{variant} is not cached");
        }
    } else {
        let removed = cache.clear_all_models().context("Failed to clear cache")?;
        if removed == 0 {
            println!("Cache was already empty");
        } else {
            println!("Removed {removed} cached model(s)");
        }
    }
    println!("Cache directory: {}", cache.cache_dir().display());
    Ok(())
}

fn show_cache_dir(cli: &Cli) -> Result<()> {
    let cache = open_cache(cli)?;
    println!("{}", cache.cache_dir().display());
    if cli.cache_dir.is_none() && std::env::var(crate::cache::CACHE_DIR_ENV).is_ok() {
        println!("(from {})", crate::cache::CACHE_DIR_ENV);
    }
    Ok(())
}

fn resolve_variant(cli: &Cli) -> ModelVariant {
    let preference = match ModelPreference::new() {
        Ok(preference) => Some(preference),
        Err(e) => {
            warn!("Model selection will not be remembered: {}", e);
            None
        },
    };

    match (cli.model, preference) {
        (Some(variant), Some(preference)) => {
            preference.store(variant);
            variant
        },
        (Some(variant), None) => variant,
        (None, Some(preference)) => preference.load(),
        (None, None) => ModelVariant::default(),
    }
}

fn engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut builder = EngineConfig::builder()
        .backend(cli.backend)
        .execution_provider(cli.execution_provider)
        .intra_threads(cli.threads)
        .disable_cache(cli.no_cache);
    if let Some(dir) = &cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    builder.build().context("Invalid configuration")
}

async fn run(cli: Cli) -> Result<()> {
    let variant = resolve_variant(&cli);
    let config = engine_config(&cli)?;

    let files = collect_inputs(&cli.input, cli.recursive)?;
    if files.is_empty() {
        anyhow::bail!("No image files found in the given inputs");
    }
    let images = decode_inputs(files).await;
    if images.is_empty() {
        anyhow::bail!("None of the inputs could be decoded");
    }

    let loader = ModelLoader::from_config(&config).context("Failed to set up model loading")?;
    let worker = ModelWorker::new(loader);

    let descriptor = variant.descriptor();
    if worker.is_model_cached(variant).await {
        info!("Using cached {} weights", descriptor.display_name);
    } else {
        info!("Downloading {} weights from {}", descriptor.display_name, descriptor.source_url);
    }
    info!("Backend: {}, provider: {}", config.backend, config.execution_provider);

    let names: Vec<String> = images.iter().map(|(name, _)| name.clone()).collect();
    let jobs = images
        .into_iter()
        .map(|(name, image)| BatchJob::new(name).with_source(image))
        .collect();

    let observer = Arc::new(CliObserver::new(names));
    let batch = BatchProcessor::new(
        jobs,
        variant,
        Arc::new(worker.clone()),
        observer.clone(),
        BatchConfig::default(),
    );

    let start = Instant::now();
    let outcome = batch.run().await;
    observer.finish();
    let summary = outcome.context("Model could not be loaded")?;

    let output_dir = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
    let finished = batch.finished();
    if finished.is_empty() {
        warn!("Nothing to write");
    }
    for path in write_outputs(&finished, &output_dir, cli.preview_background, cli.archive)? {
        println!("{}", path.display());
    }
    worker.shutdown().await;

    info!(
        "Processed {} image(s) in {:.2}s ({} failed)",
        summary.done,
        start.elapsed().as_secs_f64(),
        summary.error
    );
    if summary.error > 0 {
        anyhow::bail!("{} of {} image(s) failed", summary.error, summary.total);
    }
    Ok(())
}

/// Expand directories into their image files, in name order
fn collect_inputs(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            let depth = if recursive { usize::MAX } else { 1 };
            for entry in walkdir::WalkDir::new(input)
                .max_depth(depth)
                .sort_by_file_name()
            {
                let entry =
                    entry.with_context(|| format!("Failed to read {}", input.display()))?;
                if entry.file_type().is_file() && is_image_file(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else {
            anyhow::bail!("Input not found: {}", input.display());
        }
    }
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Decode every file off the runtime threads; undecodable files are skipped
async fn decode_inputs(files: Vec<PathBuf>) -> Vec<(String, DynamicImage)> {
    let tasks = files.into_iter().map(|path| {
        tokio::task::spawn_blocking(move || {
            let decoded = image::open(&path);
            (path, decoded)
        })
    });

    futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok((path, Ok(image))) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                Some((name, image))
            },
            Ok((path, Err(e))) => {
                warn!("Skipping {}: {}", path.display(), e);
                None
            },
            Err(e) => {
                warn!("Decoder task failed: {}", e);
                None
            },
        })
        .collect()
}

/// `photo.jpg` -> `photo-preview.png`
fn preview_file_name(source_name: &str) -> String {
    let stem = Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{stem}-preview.png")
}

/// Write the cut-outs, plus flattened previews when a background is given
///
/// Cut-outs are exported untouched with their mask alpha; `--archive` bundles
/// them into one ZIP when there are several.
fn write_outputs(
    finished: &[(String, Arc<RgbaImage>)],
    output_dir: &Path,
    preview: Option<Background>,
    archive: bool,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    if archive {
        let images: Vec<(&str, &RgbaImage)> = finished
            .iter()
            .map(|(name, image)| (name.as_str(), image.as_ref()))
            .collect();
        if let Some(artifact) = export_images(&images).context("Failed to export results")? {
            written.push(artifact.write_to_dir(output_dir)?);
        }
    } else {
        for (name, image) in finished {
            if let Some(artifact) = export_images(&[(name.as_str(), image.as_ref())])
                .with_context(|| format!("Failed to export {name}"))?
            {
                written.push(artifact.write_to_dir(output_dir)?);
            }
        }
    }

    if let Some(background) = preview {
        for (name, image) in finished {
            let flat = DynamicImage::ImageRgb8(composite_over(image, background)).to_rgba8();
            let artifact = ExportArtifact::Single {
                file_name: preview_file_name(name),
                bytes: encode_png(&flat)
                    .with_context(|| format!("Failed to encode preview of {name}"))?,
            };
            written.push(artifact.write_to_dir(output_dir)?);
        }
    }

    Ok(written)
}

/// Progress bar for the model load, log lines for job transitions
struct CliObserver {
    load_bar: ProgressBar,
    names: Vec<String>,
}

impl CliObserver {
    fn new(names: Vec<String>) -> Self {
        let load_bar = ProgressBar::new(100);
        load_bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:<20} [{bar:40.cyan/blue}] {pos:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { load_bar, names }
    }

    fn name(&self, index: usize) -> &str {
        self.names.get(index).map_or("?", String::as_str)
    }

    fn finish(&self) {
        if !self.load_bar.is_finished() {
            self.load_bar.finish_and_clear();
        }
    }
}

impl BatchObserver for CliObserver {
    fn on_load_progress(&self, variant: ModelVariant, fraction: f32) {
        self.load_bar
            .set_message(format!("Loading {}", variant.descriptor().display_name));
        self.load_bar
            .set_position((fraction.clamp(0.0, 1.0) * 100.0).round() as u64);
        if fraction >= 1.0 {
            self.load_bar.finish_with_message(format!(
                "{} ready",
                variant.descriptor().display_name
            ));
        }
    }

    fn on_job_status(&self, index: usize, status: JobStatus) {
        match status {
            JobStatus::Processing => info!("Processing {}", self.name(index)),
            JobStatus::Done => info!("Finished {}", self.name(index)),
            JobStatus::Error => warn!("Failed {}", self.name(index)),
            JobStatus::Pending => {},
        }
    }
}
