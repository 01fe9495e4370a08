//! Batch processing state machine
//!
//! Jobs move `Pending -> Processing -> Done | Error`, strictly one at a time
//! and in index order. A failure on one image marks only that job.
//!
//! The job currently on display gets a timed reveal once its cut-out is
//! ready: a progress value falling from 1 to 0 along an ease-out curve, after
//! which the display switches to the processed image. While a reveal runs,
//! display syncing is suspended so nothing else replaces the image mid-way.
//!
//! Selecting another model variant resets every job to `Pending`. If an
//! inference is outstanding at that moment the switch is deferred until it
//! returns, and that stale result is discarded.

use crate::compositing::apply_mask;
use crate::config::BatchConfig;
use crate::error::{BgRemovalError, Result};
use crate::export::{export_images, ExportArtifact};
use crate::models::ModelVariant;
use crate::types::InferenceOutput;
use crate::worker::{ModelWorker, ProgressCallback};
use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Per-job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

/// One image in the batch
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub name: String,
    /// Decoded source, `None` until decoding finishes
    pub source: Option<Arc<DynamicImage>>,
    pub processed: Option<Arc<RgbaImage>>,
    pub status: JobStatus,
    /// Variant that produced `processed`; set only when `Done`
    pub model_used: Option<ModelVariant>,
    pub error: Option<String>,
}

impl BatchJob {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            source: None,
            processed: None,
            status: JobStatus::Pending,
            model_used: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, image: DynamicImage) -> Self {
        self.source = Some(Arc::new(image));
        self
    }

    fn is_ready(&self) -> bool {
        self.status == JobStatus::Pending && self.source.is_some()
    }

    fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.processed = None;
        self.model_used = None;
        self.error = None;
    }
}

/// What the display surface should show
#[derive(Debug, Clone, Default)]
pub enum DisplayedImage {
    #[default]
    Empty,
    Original(Arc<DynamicImage>),
    Processed(Arc<RgbaImage>),
}

/// Outcome of a variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Same variant as the active one
    Unchanged,
    /// All jobs were reset to pending
    Applied,
    /// An inference is outstanding; the reset happens when it returns
    Deferred,
}

/// Counts after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub done: usize,
    pub error: usize,
    pub pending: usize,
}

/// Produces masks for the batch driver
#[async_trait]
pub trait MaskProvider: Send + Sync {
    /// Make `variant` ready, reporting load progress
    async fn ensure_model(&self, variant: ModelVariant, progress: ProgressCallback) -> Result<()>;

    /// Compute the mask of `image` with `variant`
    async fn infer(&self, image: Arc<DynamicImage>, variant: ModelVariant)
        -> Result<InferenceOutput>;
}

#[async_trait]
impl MaskProvider for ModelWorker {
    async fn ensure_model(&self, variant: ModelVariant, progress: ProgressCallback) -> Result<()> {
        self.request_load(variant, Some(progress)).await
    }

    async fn infer(
        &self,
        image: Arc<DynamicImage>,
        variant: ModelVariant,
    ) -> Result<InferenceOutput> {
        self.process_image(image, variant).await
    }
}

/// Receives batch state changes; every method defaults to a no-op
pub trait BatchObserver: Send + Sync {
    fn on_job_status(&self, _index: usize, _status: JobStatus) {}

    /// The displayed job started (`true`) or finished (`false`) processing
    fn on_processing(&self, _index: usize, _processing: bool) {}

    fn on_load_progress(&self, _variant: ModelVariant, _fraction: f32) {}

    fn on_reveal_progress(&self, _index: usize, _progress: f32) {}

    fn on_display_changed(&self, _index: usize, _display: &DisplayedImage) {}

    /// A new variant became active (the selection worth persisting)
    fn on_variant_changed(&self, _variant: ModelVariant) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl BatchObserver for NoOpObserver {}

/// Reveal interpolation: 1 at the start, 0 at `duration`, ease-out cubic
#[must_use]
pub fn reveal_progress(elapsed: Duration, duration: Duration) -> f32 {
    if duration.is_zero() {
        return 0.0;
    }
    let progress = (elapsed.as_secs_f32() / duration.as_secs_f32()).clamp(0.0, 1.0);
    let ease_out = 1.0 - (1.0 - progress).powi(3);
    1.0 - ease_out
}

enum Notice {
    Status(usize, JobStatus),
    Processing(usize, bool),
    Display(usize, DisplayedImage),
    Variant(ModelVariant),
}

struct Reveal {
    index: usize,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct BatchInner {
    jobs: Vec<BatchJob>,
    active_variant: ModelVariant,
    running: bool,
    in_flight: Option<usize>,
    /// Job whose processing indicator is showing
    processing_shown: Option<usize>,
    pending_switch: Option<ModelVariant>,
    /// Bumped on every applied switch; results from older epochs are stale
    epoch: u64,
    displayed_index: usize,
    display: DisplayedImage,
    reveal: Option<Reveal>,
    reveal_generation: u64,
}

impl BatchInner {
    fn next_ready(&self) -> Option<usize> {
        self.jobs.iter().position(BatchJob::is_ready)
    }

    fn displayed_job_image(&self) -> DisplayedImage {
        match self.jobs.get(self.displayed_index) {
            Some(job) => match (&job.processed, &job.source) {
                (Some(processed), _) => DisplayedImage::Processed(Arc::clone(processed)),
                (None, Some(source)) => DisplayedImage::Original(Arc::clone(source)),
                (None, None) => DisplayedImage::Empty,
            },
            None => DisplayedImage::Empty,
        }
    }

    /// Re-derive the display from the displayed job unless a reveal owns it
    fn sync_display(&mut self, notices: &mut Vec<Notice>) {
        if self.reveal.is_some() {
            return;
        }
        self.display = self.displayed_job_image();
        notices.push(Notice::Display(self.displayed_index, self.display.clone()));
    }

    fn cancel_reveal(&mut self) {
        if let Some(reveal) = self.reveal.take() {
            debug!(index = reveal.index, "reveal cancelled");
            if let Some(task) = reveal.task {
                task.abort();
            }
        }
    }

    fn clear_processing(&mut self, notices: &mut Vec<Notice>) {
        if let Some(index) = self.processing_shown.take() {
            notices.push(Notice::Processing(index, false));
        }
    }

    fn apply_switch(&mut self, variant: ModelVariant, notices: &mut Vec<Notice>) {
        self.cancel_reveal();
        self.active_variant = variant;
        self.epoch += 1;
        for (index, job) in self.jobs.iter_mut().enumerate() {
            job.reset();
            notices.push(Notice::Status(index, JobStatus::Pending));
        }
        notices.push(Notice::Variant(variant));
        self.sync_display(notices);
        info!(%variant, jobs = self.jobs.len(), "model variant switched, batch reset");
    }

    fn summary(&self) -> BatchSummary {
        let count = |status| self.jobs.iter().filter(|j| j.status == status).count();
        BatchSummary {
            total: self.jobs.len(),
            done: count(JobStatus::Done),
            error: count(JobStatus::Error),
            pending: count(JobStatus::Pending),
        }
    }
}

/// Releases the run flag when `run` ends, including when its future is dropped
struct RunGuard<'a> {
    processor: &'a BatchProcessor,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut notices = Vec::new();
        {
            let mut inner = self.processor.lock();
            inner.running = false;
            inner.clear_processing(&mut notices);
            if let Some(index) = inner.in_flight.take() {
                debug!(index, "run dropped mid-inference, job back to pending");
                if let Some(job) = inner.jobs.get_mut(index) {
                    if job.status == JobStatus::Processing {
                        job.status = JobStatus::Pending;
                        notices.push(Notice::Status(index, JobStatus::Pending));
                    }
                }
                if let Some(next) = inner.pending_switch.take() {
                    inner.apply_switch(next, &mut notices);
                }
            }
        }
        self.processor.emit(notices);
    }
}

/// Drives a batch of images through a [`MaskProvider`]
///
/// Cheap to clone; clones share one batch.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Mutex<BatchInner>>,
    provider: Arc<dyn MaskProvider>,
    observer: Arc<dyn BatchObserver>,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(
        jobs: Vec<BatchJob>,
        variant: ModelVariant,
        provider: Arc<dyn MaskProvider>,
        observer: Arc<dyn BatchObserver>,
        config: BatchConfig,
    ) -> Self {
        let mut inner = BatchInner {
            jobs,
            active_variant: variant,
            running: false,
            in_flight: None,
            processing_shown: None,
            pending_switch: None,
            epoch: 0,
            displayed_index: 0,
            display: DisplayedImage::Empty,
            reveal: None,
            reveal_generation: 0,
        };
        inner.display = inner.displayed_job_image();
        Self {
            inner: Arc::new(Mutex::new(inner)),
            provider,
            observer,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Status(index, status) => self.observer.on_job_status(index, status),
                Notice::Processing(index, busy) => self.observer.on_processing(index, busy),
                Notice::Display(index, display) => self.observer.on_display_changed(index, &display),
                Notice::Variant(variant) => self.observer.on_variant_changed(variant),
            }
        }
    }

    #[must_use]
    pub fn active_variant(&self) -> ModelVariant {
        self.lock().active_variant
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Whether some job is pending with a decoded source
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.lock().next_ready().is_some()
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<JobStatus> {
        self.lock().jobs.iter().map(|j| j.status).collect()
    }

    #[must_use]
    pub fn job(&self, index: usize) -> Option<BatchJob> {
        self.lock().jobs.get(index).cloned()
    }

    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        self.lock().summary()
    }

    #[must_use]
    pub fn displayed_index(&self) -> usize {
        self.lock().displayed_index
    }

    #[must_use]
    pub fn display(&self) -> DisplayedImage {
        self.lock().display.clone()
    }

    #[must_use]
    pub fn is_revealing(&self) -> bool {
        self.lock().reveal.is_some()
    }

    /// Attach the decoded source of job `index`
    ///
    /// The job becomes ready but is only processed by a running or later
    /// [`run`](Self::run).
    ///
    /// # Errors
    /// - `index` out of range
    pub fn set_source(&self, index: usize, image: DynamicImage) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut inner = self.lock();
            let job = inner.jobs.get_mut(index).ok_or_else(|| {
                BgRemovalError::invalid_config(format!("No job at index {index}"))
            })?;
            job.source = Some(Arc::new(image));
            if index == inner.displayed_index {
                inner.sync_display(&mut notices);
            }
        }
        self.emit(notices);
        Ok(())
    }

    /// Show job `index`; cancels a reveal running for another job
    ///
    /// # Errors
    /// - `index` out of range
    pub fn set_displayed_index(&self, index: usize) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut inner = self.lock();
            if index >= inner.jobs.len() {
                return Err(BgRemovalError::invalid_config(format!(
                    "No job at index {index}"
                )));
            }
            if inner.displayed_index == index {
                return Ok(());
            }
            inner.cancel_reveal();
            inner.displayed_index = index;
            inner.sync_display(&mut notices);
        }
        self.emit(notices);
        Ok(())
    }

    /// Select the active model variant
    ///
    /// A different variant resets every job to pending, or is deferred until
    /// the outstanding inference returns. An applied switch does not start
    /// processing; an idle caller follows up with [`run`](Self::run).
    pub fn select_variant(&self, variant: ModelVariant) -> SwitchOutcome {
        let mut notices = Vec::new();
        let outcome = {
            let mut inner = self.lock();
            if inner.in_flight.is_some() {
                if variant == inner.active_variant {
                    inner.pending_switch = None;
                    SwitchOutcome::Unchanged
                } else {
                    debug!(%variant, "variant switch deferred until inference returns");
                    inner.pending_switch = Some(variant);
                    SwitchOutcome::Deferred
                }
            } else if variant == inner.active_variant {
                SwitchOutcome::Unchanged
            } else {
                inner.apply_switch(variant, &mut notices);
                SwitchOutcome::Applied
            }
        };
        self.emit(notices);
        outcome
    }

    /// Process every pending job, in index order, until none remain
    ///
    /// Returns immediately if a run is already in progress. A model load
    /// failure stops the run and is returned; jobs stay pending so a later
    /// call retries.
    ///
    /// Nothing starts a run implicitly: after [`select_variant`] applies a
    /// switch or [`set_source`] makes a job ready while idle, call `run`
    /// again (see [`has_pending`]).
    ///
    /// Dropping the returned future mid-inference puts the claimed job back
    /// to pending and applies a deferred switch, so the batch stays usable.
    ///
    /// [`select_variant`]: Self::select_variant
    /// [`set_source`]: Self::set_source
    /// [`has_pending`]: Self::has_pending
    ///
    /// # Errors
    /// - `LoadNetwork` / `LoadConstruction` / `WorkerFault` from model loading
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<BatchSummary> {
        {
            let mut inner = self.lock();
            if inner.running {
                debug!("batch already running");
                return Ok(inner.summary());
            }
            inner.running = true;
        }

        let guard = RunGuard { processor: self };
        let result = self.drive().await;
        drop(guard);

        let summary = self.summary();

        match result {
            Ok(()) => {
                info!(
                    done = summary.done,
                    error = summary.error,
                    pending = summary.pending,
                    "batch finished"
                );
                Ok(summary)
            },
            Err(e) => {
                warn!(error = %e, "batch stopped");
                Err(e)
            },
        }
    }

    async fn drive(&self) -> Result<()> {
        let mut ready_variant: Option<ModelVariant> = None;

        loop {
            let variant = {
                let inner = self.lock();
                if inner.next_ready().is_none() {
                    return Ok(());
                }
                inner.active_variant
            };

            if ready_variant != Some(variant) {
                let observer = Arc::clone(&self.observer);
                let progress: ProgressCallback =
                    Arc::new(move |fraction| observer.on_load_progress(variant, fraction));
                self.provider.ensure_model(variant, progress).await?;
                ready_variant = Some(variant);
            }

            let mut notices = Vec::new();
            let claimed = {
                let mut inner = self.lock();
                if inner.active_variant != variant {
                    None
                } else if let Some(index) = inner.next_ready() {
                    let epoch = inner.epoch;
                    let displayed = index == inner.displayed_index;
                    let source = inner.jobs.get_mut(index).and_then(|job| {
                        job.status = JobStatus::Processing;
                        job.source.clone()
                    });
                    inner.in_flight = Some(index);
                    notices.push(Notice::Status(index, JobStatus::Processing));
                    if displayed {
                        inner.processing_shown = Some(index);
                        notices.push(Notice::Processing(index, true));
                    }
                    source.map(|source| (index, source, epoch))
                } else {
                    None
                }
            };
            self.emit(notices);

            let Some((index, source, epoch)) = claimed else {
                continue;
            };

            debug!(index, %variant, "processing job");
            let result = self.provider.infer(Arc::clone(&source), variant).await;
            self.complete(index, &source, variant, epoch, result);
        }
    }

    fn complete(
        &self,
        index: usize,
        source: &DynamicImage,
        variant: ModelVariant,
        epoch: u64,
        result: Result<InferenceOutput>,
    ) {
        let mut notices = Vec::new();
        {
            let mut inner = self.lock();
            inner.in_flight = None;
            inner.clear_processing(&mut notices);

            let displayed = index == inner.displayed_index;

            if let Some(next) = inner.pending_switch.take() {
                debug!(index, "discarding result issued before variant switch");
                inner.apply_switch(next, &mut notices);
            } else if inner.epoch != epoch {
                debug!(index, "discarding stale result");
            } else {
                let outcome = result.and_then(|output| {
                    if output.variant == variant {
                        apply_mask(&source.to_rgba8(), &output.mask)
                    } else {
                        Err(BgRemovalError::inference(format!(
                            "expected a {variant} mask, got {}",
                            output.variant
                        )))
                    }
                });

                let status = match outcome {
                    Ok(cutout) => {
                        let cutout = Arc::new(cutout);
                        if let Some(job) = inner.jobs.get_mut(index) {
                            job.processed = Some(Arc::clone(&cutout));
                            job.status = JobStatus::Done;
                            job.model_used = Some(variant);
                        }
                        if displayed {
                            self.start_reveal(&mut inner, index, cutout);
                        }
                        JobStatus::Done
                    },
                    Err(e) => {
                        warn!(index, error = %e, "job failed");
                        if let Some(job) = inner.jobs.get_mut(index) {
                            job.status = JobStatus::Error;
                            job.error = Some(e.to_string());
                        }
                        JobStatus::Error
                    },
                };
                notices.push(Notice::Status(index, status));
            }
        }
        self.emit(notices);
    }

    fn start_reveal(&self, inner: &mut BatchInner, index: usize, cutout: Arc<RgbaImage>) {
        inner.cancel_reveal();
        inner.reveal_generation += 1;
        let generation = inner.reveal_generation;

        let processor = self.clone();
        let task = tokio::spawn(async move {
            processor.run_reveal(index, generation, cutout).await;
        });

        inner.reveal = Some(Reveal {
            index,
            generation,
            task: Some(task),
        });
    }

    fn reveal_is_current(&self, generation: u64) -> bool {
        self.lock()
            .reveal
            .as_ref()
            .is_some_and(|r| r.generation == generation)
    }

    async fn run_reveal(&self, index: usize, generation: u64, cutout: Arc<RgbaImage>) {
        let duration = self.config.reveal_duration;
        let start = tokio::time::Instant::now();

        loop {
            if !self.reveal_is_current(generation) {
                return;
            }
            let elapsed = start.elapsed();
            self.observer
                .on_reveal_progress(index, reveal_progress(elapsed, duration));
            if elapsed >= duration {
                break;
            }
            tokio::time::sleep(self.config.reveal_tick.min(duration - elapsed)).await;
        }

        let mut notices = Vec::new();
        {
            let mut inner = self.lock();
            let current = inner
                .reveal
                .as_ref()
                .is_some_and(|r| r.generation == generation);
            if !current {
                return;
            }
            inner.reveal = None;
            inner.display = DisplayedImage::Processed(cutout);
            notices.push(Notice::Display(index, inner.display.clone()));
        }
        self.emit(notices);
    }

    /// Wait for the running reveal, if any, to finish
    pub async fn wait_for_reveal(&self) {
        let task = self.lock().reveal.as_mut().and_then(|r| r.task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Name and cut-out of every `Done` job, in index order
    #[must_use]
    pub fn finished(&self) -> Vec<(String, Arc<RgbaImage>)> {
        self.lock()
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Done)
            .filter_map(|job| job.processed.clone().map(|img| (job.name.clone(), img)))
            .collect()
    }

        /// Export every finished job: one PNG, or a ZIP for several
    ///
    /// # Errors
    /// - PNG encoding or archive failures
    pub fn export(&self) -> Result<Option<ExportArtifact>> {
        let finished = self.finished();
        let borrowed: Vec<(&str, &RgbaImage)> = finished
            .iter()
            .map(|(name, image)| (name.as_str(), image.as_ref()))
            .collect();
        export_images(&borrowed)
    }
}
