use image::DynamicImage;
use tracing::debug;

use crate::error::ConversionError;

/// Encode `image` as lossy WebP. Images with an alpha channel keep it.
pub fn encode(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, ConversionError> {
    let quality = quality.clamp(1, 100) as f32;

    let encoded = if image.color().has_alpha() {
        let rgba_image = image.to_rgba8();
        let (width, height) = rgba_image.dimensions();
        webp::Encoder::from_rgba(rgba_image.as_raw(), width, height)
            .encode_simple(false, quality)
            .map(|memory| memory.to_vec())
    } else {
        let rgb_image = image.to_rgb8();
        let (width, height) = rgb_image.dimensions();
        webp::Encoder::from_rgb(rgb_image.as_raw(), width, height)
            .encode_simple(false, quality)
            .map(|memory| memory.to_vec())
    };

    match encoded {
        Ok(data) => {
            debug!("WebP encoded: {} bytes at quality {}", data.len(), quality);
            Ok(data)
        }
        Err(e) => Err(ConversionError::EncodeError(format!(
            "WebP encoding failed: {:?}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};

    #[test]
    fn test_encode_writes_riff_container() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(10, 10, Rgb([128u8, 64, 32])));
        let data = encode(&img, 80).unwrap();

        assert!(data.len() >= 12);
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_encode_keeps_alpha() {
        let img = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(
            16,
            16,
            Rgba([255u8, 0, 0, 100]),
        ));
        let data = encode(&img, 75).unwrap();

        let decoded = image::load_from_memory(&data).unwrap();
        assert!(decoded.color().has_alpha());
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }
}
