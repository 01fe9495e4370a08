//! Mock sessions and fetchers for exercising the pipeline without real models

use crate::{
    cache::ModelStore,
    download::{ChunkProgress, ModelFetcher},
    error::{BgRemovalError, Result},
    inference::{InferenceSession, SessionFactory},
    models::ModelDescriptor,
};
use async_trait::async_trait;
use ndarray::{Array4, ArrayD};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a mock session does when run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockBehavior {
    /// Output a uniform saliency map
    Fill(f32),
    /// Return an inference error
    Fail,
    /// Panic inside the session, simulating a crashed worker
    Panic,
}

/// Session factory producing [`MockSession`]s
#[derive(Debug, Clone)]
pub struct MockSessionFactory {
    behavior: Arc<Mutex<MockBehavior>>,
    fail_construction: bool,
    run_delay: Duration,
    call_history: Arc<Mutex<Vec<String>>>,
    created: Arc<AtomicUsize>,
}

impl MockSessionFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            behavior: Arc::new(Mutex::new(MockBehavior::Fill(1.0))),
            fail_construction: false,
            run_delay: Duration::ZERO,
            call_history: Arc::new(Mutex::new(Vec::new())),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn failing_construction() -> Self {
        let mut factory = Self::new();
        factory.fail_construction = true;
        factory
    }

    #[must_use]
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Change the behavior of every session created by this factory
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn get_call_history(&self) -> Vec<String> {
        self.call_history.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        weights: &[u8],
    ) -> Result<Box<dyn InferenceSession>> {
        self.call_history
            .lock()
            .unwrap()
            .push(format!("create:{}:{}", descriptor.id, weights.len()));
        if self.fail_construction {
            return Err(BgRemovalError::load_construction("mock construction failure"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            resolution: descriptor.input_resolution as usize,
            model_id: descriptor.id,
            behavior: Arc::clone(&self.behavior),
            run_delay: self.run_delay,
            call_history: Arc::clone(&self.call_history),
        }))
    }
}

/// Session returning a uniform `[1, 1, R, R]` map
pub struct MockSession {
    resolution: usize,
    model_id: &'static str,
    behavior: Arc<Mutex<MockBehavior>>,
    run_delay: Duration,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl InferenceSession for MockSession {
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        self.call_history
            .lock()
            .unwrap()
            .push(format!("run:{}:{:?}", self.model_id, input.shape()));
        if !self.run_delay.is_zero() {
            std::thread::sleep(self.run_delay);
        }
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            MockBehavior::Fill(value) => Ok(Array4::<f32>::from_elem(
                (1, 1, self.resolution, self.resolution),
                value,
            )
            .into_dyn()),
            MockBehavior::Fail => Err(BgRemovalError::inference("mock inference failure")),
            MockBehavior::Panic => panic!("mock session crashed"),
        }
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}

/// Fetcher serving fixed bytes, counting requests
#[derive(Debug, Clone)]
pub struct MockFetcher {
    body: Vec<u8>,
    declare_length: bool,
    fail: bool,
    delay: Duration,
    fetches: Arc<AtomicUsize>,
}

impl MockFetcher {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            declare_length: true,
            fail: false,
            delay: Duration::ZERO,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        let mut fetcher = Self::new(Vec::new());
        fetcher.fail = true;
        fetcher
    }

    #[must_use]
    pub fn without_length(mut self) -> Self {
        self.declare_length = false;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelFetcher for MockFetcher {
    async fn fetch(&self, url: &str, on_chunk: ChunkProgress<'_>) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(BgRemovalError::load_network(format!("HTTP error 503 for {url}")));
        }
        let total = self.declare_length.then_some(self.body.len() as u64);
        let half = self.body.len() / 2;
        on_chunk(half as u64, total);
        on_chunk(self.body.len() as u64, total);
        Ok(self.body.clone())
    }
}

/// Store whose every operation fails, counting attempts
#[derive(Debug, Default)]
pub struct BrokenStore {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl BrokenStore {
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelStore for BrokenStore {
    async fn contains(&self, key: &str) -> Result<bool> {
        Err(BgRemovalError::cache(format!("cannot stat {key}")))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(BgRemovalError::cache(format!("cannot read {key}")))
    }

    async fn write(&self, key: &str, _bytes: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(BgRemovalError::cache(format!("disk full writing {key}")))
    }
}
