//! Inference session abstraction
//!
//! A session owns the weights and execution context of exactly one model.
//! Backends plug in through [`SessionFactory`], which builds a session from
//! the raw ONNX bytes produced by the loader.

use crate::{error::Result, models::ModelDescriptor};
use ndarray::{Array4, ArrayD};

/// A constructed, ready-to-run network
pub trait InferenceSession: Send {
    /// Run the network on a `[1, 3, R, R]` input and return the named output
    ///
    /// # Errors
    /// - Tensor conversion failures
    /// - Backend execution failures
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>>;

    /// Short backend identifier for logging
    fn backend_name(&self) -> &'static str;
}

/// Builds sessions from model bytes
pub trait SessionFactory: Send + Sync {
    /// Construct a session for `descriptor` from its ONNX `weights`
    ///
    /// # Errors
    /// - The bytes are not a loadable model for this backend
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        weights: &[u8],
    ) -> Result<Box<dyn InferenceSession>>;
}
