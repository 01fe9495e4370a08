//! Letterbox preprocessing
//!
//! The source image is scaled to fit the square network input while keeping
//! its aspect ratio, composited over black, and centered on a black canvas.
//! The resulting [`LetterboxGeometry`] is what postprocessing uses to cut the
//! padding back out of the network output.

use crate::error::{BgRemovalError, Result};
use image::{imageops, DynamicImage, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;

/// Placement of the scaled image on the square canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LetterboxGeometry {
    /// Side length of the square canvas
    pub resolution: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl LetterboxGeometry {
    /// Compute the letterbox for a `width x height` image on a `resolution` square
    ///
    /// # Errors
    /// - Zero-sized image or zero resolution
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compute(width: u32, height: u32, resolution: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(BgRemovalError::inference(format!(
                "Cannot preprocess an empty image ({width}x{height})"
            )));
        }
        if resolution == 0 {
            return Err(BgRemovalError::invalid_config("Input resolution must be positive"));
        }

        let target = f64::from(resolution);
        let scale = (target / f64::from(width)).min(target / f64::from(height));

        // Extreme aspect ratios can round a side to zero
        let scaled_width = ((f64::from(width) * scale).round() as u32).clamp(1, resolution);
        let scaled_height = ((f64::from(height) * scale).round() as u32).clamp(1, resolution);

        Ok(Self {
            resolution,
            original_width: width,
            original_height: height,
            scaled_width,
            scaled_height,
            offset_x: (resolution - scaled_width) / 2,
            offset_y: (resolution - scaled_height) / 2,
        })
    }
}

/// Letterbox-and-tensorize preprocessor
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Build the `[1, 3, R, R]` input tensor for an image
    ///
    /// Transparent source pixels are composited over black before scaling.
    /// Values are `channel / 255` with no mean/std normalization.
    ///
    /// # Errors
    /// - Empty image
    pub fn preprocess(
        image: &DynamicImage,
        resolution: u32,
    ) -> Result<(Array4<f32>, LetterboxGeometry)> {
        let geometry = LetterboxGeometry::compute(image.width(), image.height(), resolution)?;
        let canvas = Self::letterbox(image, &geometry);
        let tensor = Self::canvas_to_tensor(&canvas, resolution as usize);
        Ok((tensor, geometry))
    }

    /// Render the black canvas with the scaled image pasted at its offset
    #[must_use]
    pub fn letterbox(image: &DynamicImage, geometry: &LetterboxGeometry) -> RgbImage {
        let flattened = Self::flatten_over_black(image);
        let resized = imageops::resize(
            &flattened,
            geometry.scaled_width,
            geometry.scaled_height,
            imageops::FilterType::Triangle,
        );

        let mut canvas = ImageBuffer::from_pixel(
            geometry.resolution,
            geometry.resolution,
            Rgb([0u8, 0, 0]),
        );
        imageops::replace(
            &mut canvas,
            &resized,
            i64::from(geometry.offset_x),
            i64::from(geometry.offset_y),
        );
        canvas
    }

    fn flatten_over_black(image: &DynamicImage) -> RgbImage {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        ImageBuffer::from_fn(width, height, |x, y| {
            let [r, g, b, a] = rgba.get_pixel(x, y).0;
            let premultiply = |c: u8| ((u16::from(c) * u16::from(a) + 127) / 255) as u8;
            Rgb([premultiply(r), premultiply(g), premultiply(b)])
        })
    }

    fn canvas_to_tensor(canvas: &RgbImage, resolution: usize) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, resolution, resolution));

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match canvas size
        for (y, row) in canvas.rows().enumerate() {
            for (x, pixel) in row.enumerate() {
                tensor[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
                tensor[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
                tensor[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
            }
        }

        tensor
    }
}
