//! Conversion of the raw network output back into an image-sized mask

use crate::error::{BgRemovalError, Result};
use crate::types::SegmentationMask;
use crate::utils::preprocessing::LetterboxGeometry;
use image::{imageops, GrayImage, ImageBuffer, Luma};
use ndarray::{ArrayD, ArrayView2};

/// Turn a saliency map into a mask at the original image resolution
///
/// Accepts `[1, 1, R, R]`, `[1, R, R]` or `[R, R]` outputs. Values are
/// clamped to [0, 1] and scaled to 0-255, the letterbox padding is cropped
/// away, and the remaining region is resized to the source dimensions.
///
/// # Errors
/// - Output rank or spatial size does not match the network resolution
pub fn tensor_to_mask(output: &ArrayD<f32>, geometry: &LetterboxGeometry) -> Result<SegmentationMask> {
    let plane = saliency_plane(output, geometry.resolution as usize)?;
    let full = plane_to_alpha(&plane);

    let cropped = imageops::crop_imm(
        &full,
        geometry.offset_x,
        geometry.offset_y,
        geometry.scaled_width,
        geometry.scaled_height,
    )
    .to_image();

    let resized = imageops::resize(
        &cropped,
        geometry.original_width,
        geometry.original_height,
        imageops::FilterType::Triangle,
    );

    Ok(SegmentationMask::from_image(resized))
}

fn saliency_plane(output: &ArrayD<f32>, resolution: usize) -> Result<ArrayView2<'_, f32>> {
    let shape = output.shape().to_vec();
    let view = match shape.as_slice() {
        [1, 1, h, w] | [1, h, w] | [h, w] if *h == resolution && *w == resolution => {
            output.view().into_shape_with_order((resolution, resolution))
        },
        _ => {
            return Err(BgRemovalError::inference(format!(
                "Unexpected output tensor shape {shape:?}, expected a single {resolution}x{resolution} channel"
            )))
        },
    };
    view.map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn plane_to_alpha(plane: &ArrayView2<'_, f32>) -> GrayImage {
    let (height, width) = plane.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let value = plane
            .get((y as usize, x as usize))
            .copied()
            .unwrap_or(0.0);
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Luma([(value * 255.0).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, Array4};

    #[test]
    fn test_mask_matches_original_size() {
        let geometry = LetterboxGeometry::compute(64, 32, 16).unwrap();
        let output = Array4::<f32>::from_elem((1, 1, 16, 16), 1.0).into_dyn();
        let mask = tensor_to_mask(&output, &geometry).unwrap();
        assert_eq!(mask.dimensions, (64, 32));
        assert!(mask.data.iter().all(|&a| a == 255));
    }

    #[test]
    fn test_values_are_clamped() {
        let geometry = LetterboxGeometry::compute(4, 4, 4).unwrap();
        let mut output = Array3::<f32>::zeros((1, 4, 4));
        output[[0, 0, 0]] = -3.0;
        output[[0, 0, 1]] = 7.5;
        output[[0, 0, 2]] = 0.5;
        let mask = tensor_to_mask(&output.into_dyn(), &geometry).unwrap();
        assert_eq!(mask.alpha_at(0, 0), Some(0));
        assert_eq!(mask.alpha_at(1, 0), Some(255));
        assert_eq!(mask.alpha_at(2, 0), Some(128));
    }

    #[test]
    fn test_padding_is_cropped_out() {
        // 8x4 image on an 8x8 canvas sits in rows 2..6
        let geometry = LetterboxGeometry::compute(8, 4, 8).unwrap();
        let mut output = Array2::<f32>::zeros((8, 8));
        for y in 2..6 {
            for x in 0..8 {
                output[[y, x]] = 1.0;
            }
        }
        let mask = tensor_to_mask(&output.into_dyn(), &geometry).unwrap();
        assert_eq!(mask.dimensions, (8, 4));
        assert!(mask.data.iter().all(|&a| a == 255));
    }

    #[test]
    fn test_wrong_resolution_is_rejected() {
        let geometry = LetterboxGeometry::compute(10, 10, 320).unwrap();
        let output = Array4::<f32>::zeros((1, 1, 1024, 1024)).into_dyn();
        let err = tensor_to_mask(&output, &geometry).unwrap_err();
        assert!(matches!(err, BgRemovalError::Inference(_)));

        let multi_channel = Array4::<f32>::zeros((1, 3, 320, 320)).into_dyn();
        assert!(tensor_to_mask(&multi_channel, &geometry).is_err());
    }
}
