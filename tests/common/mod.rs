//! Shared mocks for the integration tests
//!
//! Sessions emit a uniform saliency map; a session fails any input whose
//! first red value is exactly 1.0 (a pure white, unpadded image), which lets
//! a test pick which job in a batch fails.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use ndarray::{Array4, ArrayD};
use rmbg_engine::{
    download::ChunkProgress, BgRemovalError, InferenceSession, MemoryModelStore, ModelDescriptor,
    ModelFetcher, ModelLoader, ModelStore, ModelWorker, Result, SessionFactory,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionMode {
    Fill(f32),
    Panic,
}

#[derive(Clone)]
pub struct UniformSessionFactory {
    mode: Arc<Mutex<SessionMode>>,
    created: Arc<AtomicUsize>,
    runs: Arc<Mutex<Vec<&'static str>>>,
}

impl UniformSessionFactory {
    pub fn new(value: f32) -> Self {
        Self {
            mode: Arc::new(Mutex::new(SessionMode::Fill(value))),
            created: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_mode(&self, mode: SessionMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Model id of every session run, in order
    pub fn runs(&self) -> Vec<&'static str> {
        self.runs.lock().unwrap().clone()
    }
}

impl SessionFactory for UniformSessionFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        _weights: &[u8],
    ) -> Result<Box<dyn InferenceSession>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(UniformSession {
            resolution: descriptor.input_resolution as usize,
            model_id: descriptor.id,
            mode: Arc::clone(&self.mode),
            runs: Arc::clone(&self.runs),
        }))
    }
}

struct UniformSession {
    resolution: usize,
    model_id: &'static str,
    mode: Arc<Mutex<SessionMode>>,
    runs: Arc<Mutex<Vec<&'static str>>>,
}

impl InferenceSession for UniformSession {
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        self.runs.lock().unwrap().push(self.model_id);
        if input.first().copied() == Some(1.0) {
            return Err(BgRemovalError::inference("marker input rejected"));
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            SessionMode::Fill(value) => Ok(Array4::<f32>::from_elem(
                (1, 1, self.resolution, self.resolution),
                value,
            )
            .into_dyn()),
            SessionMode::Panic => panic!("session crashed"),
        }
    }

    fn backend_name(&self) -> &'static str {
        "uniform"
    }
}

#[derive(Clone)]
pub struct CountingFetcher {
    body: Vec<u8>,
    delay: Duration,
    fail: bool,
    count: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            delay: Duration::ZERO,
            fail: false,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelFetcher for CountingFetcher {
    async fn fetch(&self, _url: &str, on_chunk: ChunkProgress<'_>) -> Result<Vec<u8>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(BgRemovalError::load_network("HTTP 404 Not Found"));
        }
        let total = self.body.len() as u64;
        for received in [total / 4, total / 2, total] {
            on_chunk(received, Some(total));
        }
        Ok(self.body.clone())
    }
}

pub fn worker_with(
    store: Arc<dyn ModelStore>,
    fetcher: &CountingFetcher,
    factory: &UniformSessionFactory,
) -> ModelWorker {
    ModelWorker::new(ModelLoader::new(
        store,
        Arc::new(fetcher.clone()),
        Arc::new(factory.clone()),
    ))
}

pub fn memory_worker(fetcher: &CountingFetcher, factory: &UniformSessionFactory) -> ModelWorker {
    worker_with(Arc::new(MemoryModelStore::new()), fetcher, factory)
}

/// Opaque gradient that never trips the failure marker
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 200) as u8, (y % 200) as u8, 77, 255])
    }))
}

/// Square image at the model resolution whose first pixel trips the marker
pub fn marker(resolution: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        resolution,
        resolution,
        Rgba([255, 255, 255, 255]),
    ))
}

pub fn progress_recorder() -> (Arc<Mutex<Vec<f32>>>, rmbg_engine::ProgressCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: rmbg_engine::ProgressCallback =
        Arc::new(move |fraction| sink.lock().unwrap().push(fraction));
    (seen, callback)
}
