use image::{ImageBuffer, Rgb};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ConversionError;
use crate::image_processing::{EditorBackend, ImageEditor, ImageRsBackend, ImageSize};
use crate::settings::TargetFormat;

pub fn write_png(path: &Path, width: u32, height: u32) {
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
    });
    image.save(path).unwrap();
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Delegates to the image-rs backend but fails the N-th save (1-based).
pub struct FailingBackend {
    inner: ImageRsBackend,
    fail_on: usize,
    saves: Arc<AtomicUsize>,
}

impl FailingBackend {
    pub fn failing_save(fail_on: usize) -> Self {
        Self {
            inner: ImageRsBackend::default(),
            fail_on,
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EditorBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn supports(&self, format: TargetFormat) -> bool {
        self.inner.supports(format)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn ImageEditor>, ConversionError> {
        Ok(Box::new(FailingEditor {
            inner: self.inner.open(path)?,
            fail_on: self.fail_on,
            saves: self.saves.clone(),
        }))
    }
}

struct FailingEditor {
    inner: Box<dyn ImageEditor>,
    fail_on: usize,
    saves: Arc<AtomicUsize>,
}

impl ImageEditor for FailingEditor {
    fn size(&self) -> ImageSize {
        self.inner.size()
    }

    fn resize(&mut self, width: u32, height: u32, crop: bool) -> Result<(), ConversionError> {
        self.inner.resize(width, height, crop)
    }

    fn save(&self, path: &Path, format: TargetFormat, quality: u8) -> Result<(), ConversionError> {
        let count = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.fail_on {
            // Leave a truncated file behind, as a crashed encoder would
            std::fs::write(path, b"RIFF").unwrap();
            return Err(ConversionError::EncodeError("simulated encoder failure".into()));
        }
        self.inner.save(path, format, quality)
    }
}

pub fn paths(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(|n| dir.join(n)).collect()
}
