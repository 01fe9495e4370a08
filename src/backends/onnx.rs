//! ONNX Runtime session backend
//!
//! Sessions are committed from in-memory weights with full graph optimization
//! and the configured execution provider. Inputs and outputs are addressed by
//! the tensor names recorded in the model registry.

use crate::config::{EngineConfig, ExecutionProvider};
use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceSession, SessionFactory};
use crate::models::ModelDescriptor;
use ndarray::{Array4, ArrayD};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

/// Builds ONNX Runtime sessions
#[derive(Debug, Clone)]
pub struct OnnxSessionFactory {
    execution_provider: ExecutionProvider,
    intra_threads: usize,
}

impl OnnxSessionFactory {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            execution_provider: config.execution_provider,
            intra_threads: config.intra_threads,
        }
    }

    /// List ONNX Runtime execution providers with their availability
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool)> {
        vec![
            ("CPU".to_string(), true),
            (
                "CUDA".to_string(),
                OrtExecutionProvider::is_available(&CUDAExecutionProvider::default())
                    .unwrap_or(false),
            ),
            (
                "CoreML".to_string(),
                OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                    .unwrap_or(false),
            ),
        ]
    }

    fn providers(&self) -> Vec<ExecutionProviderDispatch> {
        let cuda = || {
            let provider = CUDAExecutionProvider::default();
            OrtExecutionProvider::is_available(&provider)
                .unwrap_or(false)
                .then(|| provider.build())
        };
        let coreml = || {
            let provider = CoreMLExecutionProvider::default();
            OrtExecutionProvider::is_available(&provider)
                .unwrap_or(false)
                .then(|| CoreMLExecutionProvider::default().with_subgraphs(true).build())
        };

        let providers: Vec<_> = match self.execution_provider {
            ExecutionProvider::Auto => [cuda(), coreml()].into_iter().flatten().collect(),
            ExecutionProvider::Cpu => Vec::new(),
            ExecutionProvider::Cuda => cuda().into_iter().collect(),
            ExecutionProvider::CoreMl => coreml().into_iter().collect(),
        };

        if providers.is_empty() && self.execution_provider != ExecutionProvider::Cpu {
            log::warn!(
                "Execution provider '{}' not available, falling back to CPU",
                self.execution_provider
            );
        }
        providers
    }
}

impl SessionFactory for OnnxSessionFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        weights: &[u8],
    ) -> Result<Box<dyn InferenceSession>> {
        let construction =
            |stage: &str, e: ort::Error| BgRemovalError::load_construction(format!("{stage}: {e}"));

        let mut builder = Session::builder()
            .map_err(|e| construction("Failed to create session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| construction("Failed to set optimization level", e))?;

        let providers = self.providers();
        if !providers.is_empty() {
            log::info!("Hardware acceleration enabled with {} provider(s)", providers.len());
            builder = builder
                .with_execution_providers(providers)
                .map_err(|e| construction("Failed to set execution providers", e))?;
        }

        let intra_threads = if self.intra_threads > 0 {
            self.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(4)
        };

        let session = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| construction("Failed to set intra threads", e))?
            .commit_from_memory(weights)
            .map_err(|e| construction("Failed to create session from model data", e))?;

        log::debug!(
            "ONNX Runtime session ready for {} ({} intra threads)",
            descriptor.display_name,
            intra_threads
        );

        Ok(Box::new(OnnxSession {
            session,
            input_name: descriptor.input_name,
            output_name: descriptor.output_name,
        }))
    }
}

/// A committed ONNX Runtime session
pub struct OnnxSession {
    session: Session,
    input_name: &'static str,
    output_name: &'static str,
}

impl InferenceSession for OnnxSession {
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert input tensor: {e}"))
        })?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name => input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        let output = outputs
            .get(self.output_name)
            .ok_or_else(|| {
                BgRemovalError::inference(format!("Output tensor '{}' not found", self.output_name))
            })?
            .try_extract_array::<f32>()
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
            })?;

        Ok(output.to_owned())
    }

    fn backend_name(&self) -> &'static str {
        "onnx"
    }
}
