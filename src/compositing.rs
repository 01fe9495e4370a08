//! Pixel compositing
//!
//! [`apply_mask`] produces the exportable cut-out: original RGB, alpha from
//! the mask. [`composite_over`] flattens a cut-out onto a display background
//! (flat color or checkerboard) and is presentational only.

use crate::error::{BgRemovalError, Result};
use crate::types::SegmentationMask;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use std::str::FromStr;

/// Side length of one checkerboard cell, in pixels
pub const CHECKER_CELL: u32 = 16;
const CHECKER_LIGHT: [u8; 3] = [0xFF, 0xFF, 0xFF];
const CHECKER_DARK: [u8; 3] = [0xE0, 0xE0, 0xE0];

/// Keep every source RGB value and take alpha from the mask
///
/// # Errors
/// - Mask and image dimensions differ
pub fn apply_mask(original: &RgbaImage, mask: &SegmentationMask) -> Result<RgbaImage> {
    if original.dimensions() != mask.dimensions {
        return Err(BgRemovalError::inference(format!(
            "Mask dimensions {:?} do not match image dimensions {:?}",
            mask.dimensions,
            original.dimensions()
        )));
    }

    let mut output = original.clone();
    for (pixel, &alpha) in output.pixels_mut().zip(mask.data.iter()) {
        pixel[3] = alpha;
    }
    Ok(output)
}

/// Display background behind a transparent cut-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    /// Gray/white checkerboard signalling transparency
    #[default]
    Checkerboard,
    /// Flat opaque color
    Color([u8; 3]),
}

impl Background {
    /// Background color at (x, y)
    #[must_use]
    pub fn color_at(&self, x: u32, y: u32) -> [u8; 3] {
        match self {
            Background::Color(rgb) => *rgb,
            Background::Checkerboard => {
                let dark = ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0;
                if dark {
                    CHECKER_DARK
                } else {
                    CHECKER_LIGHT
                }
            },
        }
    }
}

impl FromStr for Background {
    type Err = BgRemovalError;

    /// `transparent` / `checkerboard`, or a hex color (`#RGB`, `#RRGGBB`, `#` optional)
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transparent" | "checkerboard" => Ok(Background::Checkerboard),
            other => parse_hex_color(other)
                .map(Background::Color)
                .ok_or_else(|| {
                    BgRemovalError::invalid_config(format!(
                        "Invalid background '{s}': expected 'transparent' or a hex color like #ffffff"
                    ))
                }),
        }
    }
}

/// Parse `#RGB` / `#RRGGBB` (leading `#` optional)
#[must_use]
pub fn parse_hex_color(input: &str) -> Option<[u8; 3]> {
    let hex = input.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let mut rgb = [0u8; 3];
            for (slot, c) in rgb.iter_mut().zip(hex.chars()) {
                let doubled: String = [c, c].iter().collect();
                *slot = channel(&doubled)?;
            }
            Some(rgb)
        },
        6 => Some([
            channel(hex.get(0..2)?)?,
            channel(hex.get(2..4)?)?,
            channel(hex.get(4..6)?)?,
        ]),
        _ => None,
    }
}

/// Flatten a cut-out onto `background` with standard alpha blending
#[must_use]
pub fn composite_over(cutout: &RgbaImage, background: Background) -> RgbImage {
    let (width, height) = cutout.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let Rgba([r, g, b, a]) = *cutout.get_pixel(x, y);
        let bg = background.color_at(x, y);
        let alpha = u32::from(a);
        let blend = |fg: u8, bg: u8| {
            ((u32::from(fg) * alpha + u32::from(bg) * (255 - alpha) + 127) / 255) as u8
        };
        Rgb([blend(r, bg[0]), blend(g, bg[1]), blend(b, bg[2])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mask_keeps_rgb_and_sets_alpha() {
        let original = RgbaImage::from_fn(3, 2, |x, y| Rgba([x as u8 * 40, y as u8 * 90, 7, 200]));
        let mask = SegmentationMask::new(vec![0, 50, 100, 150, 200, 255], (3, 2));
        let output = apply_mask(&original, &mask).unwrap();

        for (x, y, pixel) in output.enumerate_pixels() {
            let source = original.get_pixel(x, y);
            assert_eq!(pixel.0[..3], source.0[..3]);
            assert_eq!(Some(pixel[3]), mask.alpha_at(x, y));
        }
    }

    #[test]
    fn test_apply_mask_dimension_mismatch() {
        let original = RgbaImage::new(4, 4);
        let mask = SegmentationMask::new(vec![0; 8], (4, 2));
        assert!(apply_mask(&original, &mask).is_err());
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ffffff"), Some([255, 255, 255]));
        assert_eq!(parse_hex_color("00FF7f"), Some([0, 255, 127]));
        assert_eq!(parse_hex_color("#f0a"), Some([0xff, 0x00, 0xaa]));
        assert_eq!(parse_hex_color("#ff"), None);
        assert_eq!(parse_hex_color("#gggggg"), None);
        assert_eq!(parse_hex_color("#+1+2+3"), None);
    }

    #[test]
    fn test_background_parsing() {
        assert_eq!("transparent".parse::<Background>().unwrap(), Background::Checkerboard);
        assert_eq!("#000".parse::<Background>().unwrap(), Background::Color([0, 0, 0]));
        assert!("blue".parse::<Background>().is_err());
    }

    #[test]
    fn test_checkerboard_pattern() {
        let bg = Background::Checkerboard;
        assert_eq!(bg.color_at(0, 0), CHECKER_DARK);
        assert_eq!(bg.color_at(16, 0), CHECKER_LIGHT);
        assert_eq!(bg.color_at(0, 16), CHECKER_LIGHT);
        assert_eq!(bg.color_at(31, 31), CHECKER_DARK);
    }

    #[test]
    fn test_composite_over_color() {
        let mut cutout = RgbaImage::from_pixel(2, 1, Rgba([200, 100, 0, 255]));
        cutout.put_pixel(1, 0, Rgba([200, 100, 0, 0]));
        let flat = composite_over(&cutout, Background::Color([0, 0, 255]));
        assert_eq!(flat.get_pixel(0, 0).0, [200, 100, 0]);
        assert_eq!(flat.get_pixel(1, 0).0, [0, 0, 255]);
    }
}
