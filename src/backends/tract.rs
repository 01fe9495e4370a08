//! Tract (pure Rust) session backend
//!
//! The model is parsed from memory, pinned to the descriptor's square input
//! shape, optimized and made runnable. Tract addresses the single graph
//! input and output positionally; the registry names are only logged.

use crate::error::{BgRemovalError, Result};
use crate::inference::{InferenceSession, SessionFactory};
use crate::models::ModelDescriptor;
use ndarray::{Array4, ArrayD, IxDyn};
use tract_onnx::prelude::*;

type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Builds Tract sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct TractSessionFactory;

impl TractSessionFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SessionFactory for TractSessionFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        weights: &[u8],
    ) -> Result<Box<dyn InferenceSession>> {
        let (n, c, h, w) = descriptor.input_shape();
        log::debug!(
            "Creating Tract model for {} ({} -> {})",
            descriptor.display_name,
            descriptor.input_name,
            descriptor.output_name
        );

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(weights))
            .map_err(|e| {
                BgRemovalError::load_construction(format!("Failed to load ONNX model: {e}"))
            })?
            .with_input_fact(0, f32::fact([n, c, h, w]).into())
            .map_err(|e| {
                BgRemovalError::load_construction(format!("Failed to set input shape: {e}"))
            })?
            .into_optimized()
            .map_err(|e| {
                BgRemovalError::load_construction(format!("Failed to optimize model: {e}"))
            })?
            .into_runnable()
            .map_err(|e| {
                BgRemovalError::load_construction(format!("Failed to create runnable model: {e}"))
            })?;

        Ok(Box::new(TractSession { model }))
    }
}

/// A runnable Tract plan
pub struct TractSession {
    model: TractModel,
}

impl InferenceSession for TractSession {
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from(input.clone());

        let outputs = self
            .model
            .run(tvec![input_tensor.into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BgRemovalError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output = output_tensor.to_array_view::<f32>().map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        ArrayD::from_shape_vec(IxDyn(output.shape()), output.iter().copied().collect())
            .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))
    }

    fn backend_name(&self) -> &'static str {
        "tract"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelVariant;

    #[test]
    fn test_invalid_weights_fail_construction() {
        let factory = TractSessionFactory::new();
        let result = factory.create(ModelVariant::Rmbg.descriptor(), &[0u8; 16]);
        assert!(matches!(result, Err(BgRemovalError::LoadConstruction(_))));
    }
}
