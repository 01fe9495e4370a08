//! Static registry of the supported segmentation models

use crate::error::{BgRemovalError, Result};
use std::fmt;
use std::str::FromStr;

/// Interchangeable background-removal networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// BRIA RMBG-1.4, 1024x1024 input
    Rmbg,
    /// U2-Net, 320x320 input
    U2net,
}

impl ModelVariant {
    /// Every registered variant, in display order
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Rmbg, ModelVariant::U2net];

    /// Registry entry for this variant
    #[must_use]
    pub fn descriptor(self) -> &'static ModelDescriptor {
        match self {
            ModelVariant::Rmbg => &RMBG,
            ModelVariant::U2net => &U2NET,
        }
    }

    #[must_use]
    pub fn id(self) -> &'static str {
        self.descriptor().id
    }
}

impl Default for ModelVariant {
    fn default() -> Self {
        ModelVariant::U2net
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ModelVariant {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rmbg" | "rmbg-1.4" | "rmbg1.4" => Ok(ModelVariant::Rmbg),
            "u2net" => Ok(ModelVariant::U2net),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown model variant '{other}'. Available: {}",
                ModelVariant::ALL
                    .iter()
                    .map(|v| v.id())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Immutable description of one model artifact and its tensor interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub variant: ModelVariant,
    pub id: &'static str,
    pub display_name: &'static str,
    /// Download location of the ONNX weights; also the cache key
    pub source_url: &'static str,
    /// Side length of the square network input
    pub input_resolution: u32,
    pub input_name: &'static str,
    pub output_name: &'static str,
}

impl ModelDescriptor {
    /// NCHW shape of the input tensor
    #[must_use]
    pub fn input_shape(&self) -> (usize, usize, usize, usize) {
        let r = self.input_resolution as usize;
        (1, 3, r, r)
    }
}

static RMBG: ModelDescriptor = ModelDescriptor {
    variant: ModelVariant::Rmbg,
    id: "rmbg",
    display_name: "RMBG-1.4",
    source_url: "https://cdn.isboyjc.com/models/rmbg/rmbg1.4.onnx",
    input_resolution: 1024,
    input_name: "input",
    output_name: "output",
};

static U2NET: ModelDescriptor = ModelDescriptor {
    variant: ModelVariant::U2net,
    id: "u2net",
    display_name: "U2Net",
    source_url: "https://cdn.isboyjc.com/models/u2net/u2net.onnx",
    input_resolution: 320,
    input_name: "input.1",
    output_name: "1959",
};

/// All registry entries
pub fn descriptors() -> impl Iterator<Item = &'static ModelDescriptor> {
    ModelVariant::ALL.into_iter().map(ModelVariant::descriptor)
}
