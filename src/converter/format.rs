use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::ConversionError;
use crate::image_processing::{CodecRegistry, EditorBackend, ImageSize};
use crate::settings::{ConversionOptions, ResizeMode, TargetFormat};

/// A file written by the converter.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedFile {
    pub path: PathBuf,
    pub size: ImageSize,
}

/// Suffix for a secondary size, e.g. `-600`.
pub fn size_suffix(dimension: u32) -> String {
    format!("-{}", dimension)
}

/// Suffix for the square thumbnail, e.g. `-150x150`.
pub fn thumbnail_suffix(size: u32) -> String {
    format!("-{}x{}", size, size)
}

/// Deterministic output path: `<dir>/<stem><suffix>.<ext>`.
pub fn output_path(source: &Path, suffix: &str, format: TargetFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}{}.{}", stem, suffix, format.extension()))
}

/// Size after fitting `size` to `dimension` along `mode`. Never upscales.
pub fn fit_to_dimension(size: ImageSize, dimension: u32, mode: ResizeMode) -> ImageSize {
    if mode.extent(size.width, size.height) <= dimension {
        return size;
    }
    match mode {
        ResizeMode::Width => size.scale_width_to(dimension),
        ResizeMode::Height => size.scale_height_to(dimension),
    }
}

/// Produces one resized, re-encoded file per call.
#[derive(Clone)]
pub struct FormatConverter {
    backend: Arc<dyn EditorBackend>,
    format: TargetFormat,
    quality: u8,
    resize_mode: ResizeMode,
}

impl FormatConverter {
    /// Pick a backend for the configured format, failing when none can write it.
    pub fn new(registry: &CodecRegistry, options: &ConversionOptions) -> Result<Self, ConversionError> {
        let backend = registry.preflight(options.format)?;
        Ok(Self::with_backend(backend, options))
    }

    pub fn with_backend(backend: Arc<dyn EditorBackend>, options: &ConversionOptions) -> Self {
        Self {
            backend,
            format: options.format,
            quality: options.quality,
            resize_mode: options.resize_mode,
        }
    }

    pub fn output_path(&self, source: &Path, suffix: &str) -> PathBuf {
        output_path(source, suffix, self.format)
    }

    /// Dimensions of `source` without converting it.
    pub fn probe(&self, source: &Path) -> Result<ImageSize, ConversionError> {
        Ok(self.backend.open(source)?.size())
    }

    /// Convert to the deterministic path for `suffix`.
    pub fn convert(
        &self,
        source: &Path,
        dimension: u32,
        suffix: &str,
    ) -> Result<ConvertedFile, ConversionError> {
        let destination = self.output_path(source, suffix);
        self.convert_to(source, dimension, &destination)
    }

    /// Convert to an explicit destination.
    pub fn convert_to(
        &self,
        source: &Path,
        dimension: u32,
        destination: &Path,
    ) -> Result<ConvertedFile, ConversionError> {
        let mut editor = self.backend.open(source)?;
        let original = editor.size();
        let target = fit_to_dimension(original, dimension, self.resize_mode);

        if target != original {
            editor.resize(target.width, target.height, false)?;
        }

        editor
            .save(destination, self.format, self.quality)
            .map_err(|e| match e {
                ConversionError::EncodeError(_)
                | ConversionError::NoCodecAvailable
                | ConversionError::UnsupportedTargetFormat(_) => e,
                other => ConversionError::EncodeError(other.to_string()),
            })?;

        debug!(
            "Converted {:?} ({}x{}) -> {:?} ({}x{})",
            source,
            original.width,
            original.height,
            destination,
            editor.size().width,
            editor.size().height
        );

        Ok(ConvertedFile {
            path: destination.to_path_buf(),
            size: editor.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_shapes() {
        let source = Path::new("/up/2024/05/photo.png");
        assert_eq!(
            output_path(source, "", TargetFormat::WebP),
            PathBuf::from("/up/2024/05/photo.webp")
        );
        assert_eq!(
            output_path(source, &size_suffix(600), TargetFormat::WebP),
            PathBuf::from("/up/2024/05/photo-600.webp")
        );
        assert_eq!(
            output_path(source, &thumbnail_suffix(150), TargetFormat::Avif),
            PathBuf::from("/up/2024/05/photo-150x150.avif")
        );
    }

    #[test]
    fn test_output_path_keeps_inner_dots() {
        let source = Path::new("/up/2024/05/holiday.v2.jpeg");
        assert_eq!(
            output_path(source, "-300", TargetFormat::WebP),
            PathBuf::from("/up/2024/05/holiday.v2-300.webp")
        );
    }

    #[test]
    fn test_fit_never_upscales() {
        let size = ImageSize::new(2000, 1500);
        assert_eq!(fit_to_dimension(size, 3000, ResizeMode::Width), size);
        assert_eq!(fit_to_dimension(size, 2000, ResizeMode::Width), size);
        assert_eq!(
            fit_to_dimension(size, 1200, ResizeMode::Width),
            ImageSize::new(1200, 900)
        );
        assert_eq!(fit_to_dimension(size, 1600, ResizeMode::Height), size);
        assert_eq!(
            fit_to_dimension(size, 750, ResizeMode::Height),
            ImageSize::new(1000, 750)
        );
    }
}
