#[cfg(feature = "avif")]
pub mod avif;
pub mod webp;

use image::DynamicImage;
use std::path::Path;
use tracing::{debug, warn};

use crate::assets::lowercase_extension;
use crate::error::ConversionError;
use crate::settings::TargetFormat;

/// Whether this build can write `format`.
pub fn can_encode(format: TargetFormat) -> bool {
    match format {
        TargetFormat::WebP => true,
        TargetFormat::Avif => cfg!(feature = "avif"),
    }
}

/// Decode the image at `path`. AVIF sources go through libavif when available.
pub fn decode(path: &Path) -> Result<DynamicImage, ConversionError> {
    if lowercase_extension(path).as_deref() == Some("avif") {
        #[cfg(feature = "avif")]
        return avif::decode(path);

        #[cfg(not(feature = "avif"))]
        return Err(ConversionError::IoError(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "reading AVIF requires the avif feature",
        )));
    }

    debug!("Opening image file: {:?}", path);
    Ok(image::open(path)?)
}

/// Encode `image` into `format`.
#[allow(unused_variables)]
pub fn encode(
    image: &DynamicImage,
    format: TargetFormat,
    quality: u8,
    avif_speed: u8,
) -> Result<Vec<u8>, ConversionError> {
    match format {
        TargetFormat::WebP => webp::encode(image, quality),
        #[cfg(feature = "avif")]
        TargetFormat::Avif => avif::encode(image, quality, avif_speed),
        #[cfg(not(feature = "avif"))]
        TargetFormat::Avif => Err(ConversionError::UnsupportedTargetFormat(format)),
    }
}

/// Write encoded bytes, removing whatever was written if the write fails midway.
pub fn write_file(path: &Path, data: &[u8]) -> Result<(), ConversionError> {
    if let Err(e) = std::fs::write(path, data) {
        if path.exists()
            && let Err(cleanup) = std::fs::remove_file(path)
        {
            warn!("Failed to remove partial file {:?}: {}", path, cleanup);
        }
        return Err(ConversionError::EncodeError(format!(
            "Failed to write {:?}: {}",
            path, e
        )));
    }
    Ok(())
}
