use image::{DynamicImage, imageops::FilterType};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::formats;
use super::types::ImageSize;
use crate::error::ConversionError;
use crate::settings::TargetFormat;

/// An opened image that can be resized and saved.
pub trait ImageEditor {
    fn size(&self) -> ImageSize;

    /// Resize to exactly `width`x`height`. With `crop`, the image is scaled to
    /// cover the box and the overflow is cut from the centre.
    fn resize(&mut self, width: u32, height: u32, crop: bool) -> Result<(), ConversionError>;

    fn save(&self, path: &Path, format: TargetFormat, quality: u8) -> Result<(), ConversionError>;
}

/// A codec library able to open images and produce editors.
pub trait EditorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, format: TargetFormat) -> bool;

    fn open(&self, path: &Path) -> Result<Box<dyn ImageEditor>, ConversionError>;
}

/// Backend built on the `image` crate, with WebP and AVIF encoders.
#[derive(Debug, Clone)]
pub struct ImageRsBackend {
    avif_speed: u8,
}

impl ImageRsBackend {
    pub const NAME: &'static str = "image-rs";

    pub fn new(avif_speed: u8) -> Self {
        Self {
            avif_speed: avif_speed.min(10),
        }
    }
}

impl Default for ImageRsBackend {
    fn default() -> Self {
        Self::new(6)
    }
}

impl EditorBackend for ImageRsBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports(&self, format: TargetFormat) -> bool {
        formats::can_encode(format)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ImageEditor>, ConversionError> {
        let image = formats::decode(path)?;
        Ok(Box::new(ImageRsEditor {
            image,
            avif_speed: self.avif_speed,
        }))
    }
}

pub struct ImageRsEditor {
    image: DynamicImage,
    avif_speed: u8,
}

impl ImageRsEditor {
    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            image,
            avif_speed: ImageRsBackend::default().avif_speed,
        }
    }
}

impl ImageEditor for ImageRsEditor {
    fn size(&self) -> ImageSize {
        ImageSize::new(self.image.width(), self.image.height())
    }

    fn resize(&mut self, width: u32, height: u32, crop: bool) -> Result<(), ConversionError> {
        if width == 0 || height == 0 {
            return Err(ConversionError::EncodeError(format!(
                "Invalid resize target {}x{}",
                width, height
            )));
        }
        if self.size() == ImageSize::new(width, height) {
            return Ok(());
        }

        self.image = if crop {
            self.image.resize_to_fill(width, height, FilterType::Lanczos3)
        } else {
            self.image.resize_exact(width, height, FilterType::Lanczos3)
        };
        Ok(())
    }

    fn save(&self, path: &Path, format: TargetFormat, quality: u8) -> Result<(), ConversionError> {
        let data = formats::encode(&self.image, format, quality, self.avif_speed)?;
        formats::write_file(path, &data)?;
        debug!(
            "Saved {} {}x{} to {:?} ({} bytes)",
            format,
            self.image.width(),
            self.image.height(),
            path,
            data.len()
        );
        Ok(())
    }
}

/// The set of backends available to this process.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    backends: Vec<Arc<dyn EditorBackend>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults(avif_speed: u8) -> Self {
        Self::empty().with_backend(Arc::new(ImageRsBackend::new(avif_speed)))
    }

    /// Build from configured backend names; unknown names are skipped.
    pub fn from_names(names: &[String], avif_speed: u8) -> Self {
        let mut registry = Self::empty();
        for name in names {
            match name.as_str() {
                ImageRsBackend::NAME => {
                    registry = registry.with_backend(Arc::new(ImageRsBackend::new(avif_speed)));
                }
                other => warn!("Unknown codec backend '{}', skipping", other),
            }
        }
        registry
    }

    pub fn with_backend(mut self, backend: Arc<dyn EditorBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Pick the first backend able to write `format`.
    pub fn preflight(&self, format: TargetFormat) -> Result<Arc<dyn EditorBackend>, ConversionError> {
        if self.backends.is_empty() {
            return Err(ConversionError::NoCodecAvailable);
        }
        self.backends
            .iter()
            .find(|b| b.supports(format))
            .cloned()
            .ok_or(ConversionError::UnsupportedTargetFormat(format))
    }
}
