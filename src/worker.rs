//! Worker facade
//!
//! All CPU-bound work (session construction, tensor math, inference) runs on
//! a dedicated OS thread with its own single-threaded runtime. The facade
//! talks to it exclusively through two channels carrying a small tagged
//! message set, and keeps the bookkeeping for in-flight requests:
//!
//! - concurrent loads of the same variant share one underlying load, with
//!   progress and completion fanned out to every caller;
//! - exactly one inference may be outstanding, a second one is rejected with
//!   [`BgRemovalError::InferenceBusy`];
//! - if the worker thread dies, outstanding requests are rejected with
//!   [`BgRemovalError::WorkerFault`] and the next request spawns a fresh worker.
//!
//! Because only one inference is ever outstanding, replies are correlated by
//! message type alone.

use crate::engine::InferenceEngine;
use crate::error::{BgRemovalError, LoadFailure, LoadFailureKind, Result};
use crate::loader::{ModelLoader, PROGRESS_READY};
use crate::models::ModelVariant;
use crate::types::InferenceOutput;
use image::DynamicImage;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Load progress observer
pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Messages sent to the worker thread
#[derive(Debug)]
pub enum WorkerRequest {
    Load { variant: ModelVariant },
    Infer { image: Arc<DynamicImage> },
    Shutdown,
}

/// Messages reported back by the worker thread
#[derive(Debug)]
pub enum WorkerEvent {
    Progress { variant: ModelVariant, fraction: f32 },
    Loaded { variant: ModelVariant },
    LoadFailed { variant: ModelVariant, failure: LoadFailure },
    InferenceResult { output: InferenceOutput },
    InferenceError { message: String },
    Fault { message: String },
}

struct WorkerContext {
    generation: u64,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    thread: Option<std::thread::JoinHandle<()>>,
}

struct InFlightLoad {
    variant: ModelVariant,
    observers: Vec<ProgressCallback>,
    waiters: Vec<oneshot::Sender<std::result::Result<(), LoadFailure>>>,
}

type InferenceSlot = oneshot::Sender<Result<InferenceOutput>>;

#[derive(Default)]
struct FacadeState {
    context: Option<WorkerContext>,
    next_generation: u64,
    loaded: Option<ModelVariant>,
    loading: Option<InFlightLoad>,
    inference: Option<InferenceSlot>,
}

struct Shared {
    loader: ModelLoader,
    state: Mutex<FacadeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FacadeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = state.context.take() {
            let _ = context.requests.send(WorkerRequest::Shutdown);
        }
    }
}

/// Handle to the isolated inference worker
///
/// Cloning is cheap; all clones share one worker. The worker thread is
/// started on the first request and stopped by [`ModelWorker::shutdown`] or
/// when the last handle is dropped.
#[derive(Clone)]
pub struct ModelWorker {
    shared: Arc<Shared>,
}

enum LoadWait {
    Own(oneshot::Receiver<std::result::Result<(), LoadFailure>>),
    Other(oneshot::Receiver<std::result::Result<(), LoadFailure>>),
}

impl ModelWorker {
    #[must_use]
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader,
                state: Mutex::new(FacadeState::default()),
            }),
        }
    }

    /// Variant of the session currently live in the worker
    #[must_use]
    pub fn current_model(&self) -> Option<ModelVariant> {
        self.shared.lock().loaded
    }

    /// Whether a load is currently in flight
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.shared.lock().loading.is_some()
    }

    /// Whether the persistent cache already holds the weights for `variant`
    pub async fn is_model_cached(&self, variant: ModelVariant) -> bool {
        self.shared.loader.is_cached(variant.descriptor()).await
    }

    /// Make `variant` the loaded model
    ///
    /// Resolves immediately (reporting 1.0) when it is already loaded, joins
    /// an in-flight load of the same variant, and waits for an in-flight load
    /// of a different variant to settle before starting its own.
    ///
    /// # Errors
    /// - `LoadNetwork` / `LoadConstruction` shared by every waiting caller
    /// - `WorkerFault` if the worker dies during the load
    pub async fn request_load(
        &self,
        variant: ModelVariant,
        on_progress: Option<ProgressCallback>,
    ) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.shared.lock();

                if state.loaded == Some(variant) && state.loading.is_none() {
                    drop(state);
                    if let Some(callback) = on_progress {
                        callback(PROGRESS_READY);
                    }
                    return Ok(());
                }

                let (tx, rx) = oneshot::channel();
                match state.loading.as_mut() {
                    Some(load) if load.variant == variant => {
                        debug!(%variant, "joining in-flight load");
                        load.observers.extend(on_progress.clone());
                        load.waiters.push(tx);
                        LoadWait::Own(rx)
                    },
                    Some(load) => {
                        debug!(%variant, loading = %load.variant, "waiting for other load to settle");
                        load.waiters.push(tx);
                        LoadWait::Other(rx)
                    },
                    None => {
                        state.loading = Some(InFlightLoad {
                            variant,
                            observers: on_progress.clone().into_iter().collect(),
                            waiters: vec![tx],
                        });
                        self.dispatch(&mut state, WorkerRequest::Load { variant })?;
                        LoadWait::Own(rx)
                    },
                }
            };

            match wait {
                LoadWait::Own(rx) => {
                    return match rx.await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(failure)) => Err(failure.into()),
                        Err(_) => Err(BgRemovalError::worker_fault("load request was dropped")),
                    };
                },
                LoadWait::Other(rx) => {
                    let _ = rx.await;
                },
            }
        }
    }

    /// Run inference on `image` with the currently loaded model
    ///
    /// # Errors
    /// - `InferenceBusy` when another inference is outstanding
    /// - `ModelNotLoaded` when no model is loaded
    /// - `Inference` for a failure on this image
    /// - `WorkerFault` when the worker dies before replying
    pub async fn request_inference(&self, image: Arc<DynamicImage>) -> Result<InferenceOutput> {
        let rx = {
            let mut state = self.shared.lock();
            if state.inference.is_some() {
                return Err(BgRemovalError::InferenceBusy);
            }
            if state.loaded.is_none() && state.loading.is_none() {
                return Err(BgRemovalError::ModelNotLoaded);
            }
            let (tx, rx) = oneshot::channel();
            state.inference = Some(tx);
            if let Err(e) = self.dispatch(&mut state, WorkerRequest::Infer { image }) {
                state.inference = None;
                return Err(e);
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(BgRemovalError::worker_fault("inference request was dropped")))
    }

    /// Load `variant` if needed, then run inference
    ///
    /// # Errors
    /// - Any error of [`ModelWorker::request_load`] or [`ModelWorker::request_inference`]
    pub async fn process_image(
        &self,
        image: Arc<DynamicImage>,
        variant: ModelVariant,
    ) -> Result<InferenceOutput> {
        if self.current_model() != Some(variant) {
            self.request_load(variant, None).await?;
        }
        self.request_inference(image).await
    }

    /// Stop the worker thread and reject anything still pending
    pub async fn shutdown(&self) {
        let context = {
            let mut state = self.shared.lock();
            let context = state.context.take();
            Self::reject_pending(&mut state, "worker shut down");
            context
        };

        if let Some(mut context) = context {
            let _ = context.requests.send(WorkerRequest::Shutdown);
            if let Some(thread) = context.thread.take() {
                if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
                    warn!("failed to join worker thread");
                }
            }
            info!(generation = context.generation, "worker shut down");
        }
    }

    /// Send a request, starting the worker first if none is running
    fn dispatch(&self, state: &mut FacadeState, request: WorkerRequest) -> Result<()> {
        if state.context.is_none() {
            state.context = Some(self.spawn_worker(state.next_generation)?);
            state.next_generation += 1;
        }

        let send_result = state
            .context
            .as_ref()
            .map(|context| context.requests.send(request));
        match send_result {
            Some(Ok(())) => Ok(()),
            _ => {
                state.context = None;
                Self::reject_pending(state, "worker is not running");
                Err(BgRemovalError::worker_fault("worker is not running"))
            },
        }
    }

    fn spawn_worker(&self, generation: u64) -> Result<WorkerContext> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = InferenceEngine::new(self.shared.loader.clone());

        let thread = std::thread::Builder::new()
            .name(format!("rmbg-worker-{generation}"))
            .spawn(move || run_worker_thread(engine, request_rx, event_tx))
            .map_err(|e| BgRemovalError::worker_fault(format!("failed to start worker: {e}")))?;

        tokio::spawn(dispatch_events(
            Arc::downgrade(&self.shared),
            generation,
            event_rx,
        ));

        info!(generation, "worker started");
        Ok(WorkerContext {
            generation,
            requests: request_tx,
            thread: Some(thread),
        })
    }

    fn reject_pending(state: &mut FacadeState, message: &str) {
        state.loaded = None;
        if let Some(load) = state.loading.take() {
            let failure = LoadFailure::new(LoadFailureKind::Worker, message);
            for waiter in load.waiters {
                let _ = waiter.send(Err(failure.clone()));
            }
        }
        if let Some(slot) = state.inference.take() {
            let _ = slot.send(Err(BgRemovalError::worker_fault(message)));
        }
    }
}

/// Route events from one worker generation into the facade state
async fn dispatch_events(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        handle_event(&strong, generation, event);
    }

    if let Some(strong) = shared.upgrade() {
        handle_fault(&strong, generation, "worker terminated unexpectedly");
    }
}

fn handle_event(shared: &Shared, generation: u64, event: WorkerEvent) {
    match event {
        WorkerEvent::Progress { variant, fraction } => {
            let observers = {
                let state = shared.lock();
                match &state.loading {
                    Some(load) if load.variant == variant => load.observers.clone(),
                    _ => Vec::new(),
                }
            };
            for observer in observers {
                observer(fraction);
            }
        },
        WorkerEvent::Loaded { variant } => {
            let mut state = shared.lock();
            state.loaded = Some(variant);
            if let Some(load) = state.loading.take() {
                for waiter in load.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            info!(%variant, "model loaded");
        },
        WorkerEvent::LoadFailed { variant, failure } => {
            let mut state = shared.lock();
            state.loaded = None;
            if let Some(load) = state.loading.take() {
                for waiter in load.waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
            warn!(%variant, error = %failure.message, "model load failed");
        },
        WorkerEvent::InferenceResult { output } => {
            if let Some(slot) = shared.lock().inference.take() {
                let _ = slot.send(Ok(output));
            }
        },
        WorkerEvent::InferenceError { message } => {
            if let Some(slot) = shared.lock().inference.take() {
                let _ = slot.send(Err(BgRemovalError::inference(message)));
            }
        },
        WorkerEvent::Fault { message } => handle_fault(shared, generation, &message),
    }
}

fn handle_fault(shared: &Shared, generation: u64, message: &str) {
    let mut state = shared.lock();
    let current = state.context.as_ref().map(|c| c.generation);
    if current != Some(generation) {
        return;
    }
    error!(generation, message, "worker fault");
    state.context = None;
    ModelWorker::reject_pending(&mut state, message);
}

fn run_worker_thread(
    engine: InferenceEngine,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = events.send(WorkerEvent::Fault {
                message: format!("failed to build worker runtime: {e}"),
            });
            return;
        },
    };

    let loop_events = events.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(worker_loop(engine, requests, loop_events));
    }));

    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_string());
        let _ = events.send(WorkerEvent::Fault { message });
    }
}

async fn worker_loop(
    mut engine: InferenceEngine,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Load { variant } => {
                let progress_events = events.clone();
                let progress = move |fraction: f32| {
                    let _ = progress_events.send(WorkerEvent::Progress { variant, fraction });
                };
                let event = match engine.load(variant, &progress).await {
                    Ok(()) => WorkerEvent::Loaded { variant },
                    Err(e) => WorkerEvent::LoadFailed {
                        variant,
                        failure: LoadFailure::from(&e),
                    },
                };
                let _ = events.send(event);
            },
            WorkerRequest::Infer { image } => {
                let event = match engine.infer(&image) {
                    Ok(output) => WorkerEvent::InferenceResult { output },
                    Err(BgRemovalError::Inference(message)) => {
                        WorkerEvent::InferenceError { message }
                    },
                    Err(e) => WorkerEvent::InferenceError {
                        message: e.to_string(),
                    },
                };
                let _ = events.send(event);
            },
            WorkerRequest::Shutdown => break,
        }
    }
    debug!("worker loop finished");
}
