use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::format::{ConvertedFile, output_path, thumbnail_suffix};
use crate::error::ConversionError;
use crate::image_processing::EditorBackend;
use crate::settings::{ConversionOptions, TargetFormat};

/// Fixed-size square thumbnails, cropped to fill.
#[derive(Clone)]
pub struct ThumbnailGenerator {
    backend: Arc<dyn EditorBackend>,
    format: TargetFormat,
    quality: u8,
    size: u32,
}

impl ThumbnailGenerator {
    pub fn new(backend: Arc<dyn EditorBackend>, options: &ConversionOptions) -> Self {
        Self {
            backend,
            format: options.format,
            quality: options.quality,
            size: options.thumbnail_size.max(1),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn output_path(&self, source: &Path) -> PathBuf {
        output_path(source, &thumbnail_suffix(self.size), self.format)
    }

    pub fn generate(&self, source: &Path) -> Result<ConvertedFile, ConversionError> {
        let destination = self.output_path(source);
        self.generate_to(source, &destination)
    }

    /// Sources smaller than the square are centre-cropped to the largest square
    /// that fits rather than upscaled.
    pub fn generate_to(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<ConvertedFile, ConversionError> {
        let result = (|| -> Result<ConvertedFile, ConversionError> {
            let mut editor = self.backend.open(source)?;
            let original = editor.size();
            let side = self.size.min(original.width).min(original.height);
            editor.resize(side, side, true)?;
            editor.save(destination, self.format, self.quality)?;
            Ok(ConvertedFile {
                path: destination.to_path_buf(),
                size: editor.size(),
            })
        })();

        match result {
            Ok(file) => {
                debug!("Thumbnail {:?} -> {:?}", source, destination);
                Ok(file)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(ConversionError::EncodeError(message)) => Err(ConversionError::EncodeError(message)),
            Err(other) => Err(ConversionError::EncodeError(other.to_string())),
        }
    }
}
