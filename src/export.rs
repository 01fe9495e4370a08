//! Lossless export of finished cut-outs
//!
//! One finished image is exported as a single PNG; several are bundled into
//! one ZIP archive.

use crate::error::{BgRemovalError, Result};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::ZipWriter;

/// File name of the batch archive
pub const ARCHIVE_NAME: &str = "removebg-batch.zip";

const OUTPUT_SUFFIX: &str = "-nobg.png";

/// Result of an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportArtifact {
    /// A single PNG
    Single { file_name: String, bytes: Vec<u8> },
    /// A ZIP archive of PNGs
    Archive { file_name: String, bytes: Vec<u8> },
}

impl ExportArtifact {
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self {
            Self::Single { file_name, .. } | Self::Archive { file_name, .. } => file_name,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Single { bytes, .. } | Self::Archive { bytes, .. } => bytes,
        }
    }

    /// Write the artifact into `dir` under its file name
    ///
    /// # Errors
    /// - Directory creation or file write failures
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| BgRemovalError::file_io_error("create output directory", dir, &e))?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.bytes())
            .map_err(|e| BgRemovalError::file_io_error("write export", &path, &e))?;
        log::info!("Exported {} ({} bytes)", path.display(), self.bytes().len());
        Ok(path)
    }
}

/// `photo.jpg` -> `photo-nobg.png`
#[must_use]
pub fn output_file_name(source_name: &str) -> String {
    let stem = Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    format!("{stem}{OUTPUT_SUFFIX}")
}

/// Encode an RGBA image as PNG
///
/// # Errors
/// - PNG encoder failure
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| BgRemovalError::export(format!("Failed to encode PNG: {e}")))?;
    Ok(buffer.into_inner())
}

/// Bundle named files into an in-memory ZIP archive
///
/// Repeated names get a numeric suffix so no entry is shadowed.
///
/// # Errors
/// - Archive writer failure
pub fn build_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut used = HashSet::new();
    for (name, bytes) in entries {
        let entry_name = unique_name(name, &mut used);
        zip.start_file(entry_name.as_str(), options)
            .map_err(|e| BgRemovalError::export(format!("Failed to add {entry_name}: {e}")))?;
        zip.write_all(bytes)
            .map_err(|e| BgRemovalError::export(format!("Failed to write {entry_name}: {e}")))?;
    }

    let cursor = zip
        .finish()
        .map_err(|e| BgRemovalError::export(format!("Failed to finish archive: {e}")))?;
    Ok(cursor.into_inner())
}

fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let extension = path.extension().and_then(|s| s.to_str());
    let mut counter = 1;
    loop {
        let candidate = match extension {
            Some(ext) => format!("{stem}-{counter}.{ext}"),
            None => format!("{stem}-{counter}"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Export finished images: none -> `None`, one -> PNG, several -> ZIP
///
/// `images` pairs each source file name with its cut-out.
///
/// # Errors
/// - PNG encoding or archive failures
pub fn export_images(images: &[(&str, &RgbaImage)]) -> Result<Option<ExportArtifact>> {
    match images {
        [] => Ok(None),
        [(name, image)] => Ok(Some(ExportArtifact::Single {
            file_name: output_file_name(name),
            bytes: encode_png(image)?,
        })),
        many => {
            let entries = many
                .iter()
                .map(|(name, image)| Ok((output_file_name(name), encode_png(image)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(ExportArtifact::Archive {
                file_name: ARCHIVE_NAME.to_string(),
                bytes: build_archive(&entries)?,
            }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::io::Read;

    fn cutout() -> RgbaImage {
        RgbaImage::from_fn(5, 3, |x, y| Rgba([x as u8, y as u8, 9, (x * 50) as u8]))
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("photo.jpg"), "photo-nobg.png");
        assert_eq!(output_file_name("archive.tar.gz"), "archive.tar-nobg.png");
        assert_eq!(output_file_name("noext"), "noext-nobg.png");
        assert_eq!(output_file_name(""), "image-nobg.png");
    }

    #[test]
    fn test_png_is_lossless() {
        let original = cutout();
        let bytes = encode_png(&original).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .unwrap()
            .to_rgba8();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_export_nothing() {
        assert!(export_images(&[]).unwrap().is_none());
    }

    #[test]
    fn test_export_single() {
        let image = cutout();
        let artifact = export_images(&[("cat.webp", &image)]).unwrap().unwrap();
        assert!(matches!(artifact, ExportArtifact::Single { .. }));
        assert_eq!(artifact.file_name(), "cat-nobg.png");
    }

    #[test]
    fn test_export_archive_with_duplicate_names() {
        let image = cutout();
        let artifact = export_images(&[("a.png", &image), ("a.jpg", &image), ("b.png", &image)])
            .unwrap()
            .unwrap();
        assert_eq!(artifact.file_name(), ARCHIVE_NAME);

        let mut archive = zip::ZipArchive::new(Cursor::new(artifact.bytes().to_vec())).unwrap();
        assert_eq!(archive.len(), 3);
        let mut names: Vec<_> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(names, vec!["a-nobg-1.png", "a-nobg.png", "b-nobg.png"]);

        let mut entry = archive.by_name("b-nobg.png").unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_rgba8(), image);
    }

    #[test]
    fn test_write_to_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let artifact = ExportArtifact::Single {
            file_name: "x-nobg.png".to_string(),
            bytes: vec![1, 2, 3],
        };
        let path = artifact.write_to_dir(temp.path().join("out")).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }
}
