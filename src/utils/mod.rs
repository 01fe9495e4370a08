//! Tensor conversion helpers for the inference engine

pub mod postprocessing;
pub mod preprocessing;

pub use postprocessing::tensor_to_mask;
pub use preprocessing::{ImagePreprocessor, LetterboxGeometry};
