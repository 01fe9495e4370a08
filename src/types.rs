//! Core data types shared across the pipeline

use crate::error::{BgRemovalError, Result};
use crate::models::ModelVariant;
use image::{GrayImage, ImageBuffer, RgbaImage};

/// Per-pixel transparency buffer aligned with the source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMask {
    /// Alpha values (0-255), row-major
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Create mask from a grayscale image
    #[must_use]
    pub fn from_image(image: GrayImage) -> Self {
        let dimensions = image.dimensions();
        Self::new(image.into_raw(), dimensions)
    }

    /// Convert mask to a grayscale image
    ///
    /// # Errors
    /// - Data length does not match the dimensions
    pub fn to_image(&self) -> Result<GrayImage> {
        let (width, height) = self.dimensions;
        ImageBuffer::from_raw(width, height, self.data.clone()).ok_or_else(|| {
            BgRemovalError::inference("Mask data length does not match its dimensions")
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.dimensions.0
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.dimensions.1
    }

    /// Alpha at (x, y), `None` outside the mask
    #[must_use]
    pub fn alpha_at(&self, x: u32, y: u32) -> Option<u8> {
        let (width, height) = self.dimensions;
        if x >= width || y >= height {
            return None;
        }
        let index = y as usize * width as usize + x as usize;
        self.data.get(index).copied()
    }

    /// Fraction of pixels considered foreground (alpha > 127)
    #[must_use]
    pub fn foreground_ratio(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let foreground = self.data.iter().filter(|&&a| a > 127).count();
        foreground as f32 / self.data.len() as f32
    }
}

/// Mask result of one inference, tagged with the variant that produced it
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub variant: ModelVariant,
    pub mask: SegmentationMask,
}

/// A transparent cut-out ready for export
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Source image RGB with mask-derived alpha
    pub image: RgbaImage,
    pub variant: ModelVariant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_image_conversion() {
        let mask = SegmentationMask::new(vec![0, 64, 128, 255], (2, 2));
        let image = mask.to_image().unwrap();
        assert_eq!(image.get_pixel(1, 1).0, [255]);
        assert_eq!(SegmentationMask::from_image(image), mask);
    }

    #[test]
    fn test_mask_invalid_dimensions() {
        let mask = SegmentationMask::new(vec![0; 3], (2, 2));
        assert!(mask.to_image().is_err());
    }

    #[test]
    fn test_alpha_at_and_ratio() {
        let mask = SegmentationMask::new(vec![0, 200, 255, 10], (2, 2));
        assert_eq!(mask.alpha_at(1, 0), Some(200));
        assert_eq!(mask.alpha_at(0, 1), Some(255));
        assert_eq!(mask.alpha_at(2, 0), None);
        assert!((mask.foreground_ratio() - 0.5).abs() < f32::EPSILON);
    }
}
