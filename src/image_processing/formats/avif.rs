use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};
use libavif::is_avif;
use libavif_sys as sys;
use std::fmt::Display;
use std::path::Path;
use tracing::debug;

use crate::error::ConversionError;

/// libavif handles, each released when dropped.
struct Decoder(*mut sys::avifDecoder);
struct Encoder(*mut sys::avifEncoder);
struct AvifImage(*mut sys::avifImage);
struct RgbPixels(sys::avifRGBImage);
struct Output(sys::avifRWData);

impl Drop for Decoder {
    fn drop(&mut self) {
        unsafe { sys::avifDecoderDestroy(self.0) }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        unsafe { sys::avifEncoderDestroy(self.0) }
    }
}

impl Drop for AvifImage {
    fn drop(&mut self) {
        unsafe { sys::avifImageDestroy(self.0) }
    }
}

impl Drop for RgbPixels {
    fn drop(&mut self) {
        unsafe { sys::avifRGBImageFreePixels(&mut self.0) }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        unsafe { sys::avifRWDataFree(&mut self.0) }
    }
}

fn failed(step: &str) -> ConversionError {
    ConversionError::EncodeError(format!("AVIF: {} failed", step))
}

fn ensure<R: PartialEq + Display>(result: R, ok: R, step: &str) -> Result<(), ConversionError> {
    if result == ok {
        Ok(())
    } else {
        Err(ConversionError::EncodeError(format!(
            "AVIF: {} failed with code {}",
            step, result
        )))
    }
}

/// RGB staging buffer bound to `image`, allocated with 8 bits per channel.
unsafe fn rgb_pixels(image: &AvifImage, alpha: bool) -> Result<RgbPixels, ConversionError> {
    let mut rgb = sys::avifRGBImage::default();
    unsafe {
        sys::avifRGBImageSetDefaults(&mut rgb, image.0);
    }
    rgb.depth = 8;
    rgb.format = if alpha {
        sys::AVIF_RGB_FORMAT_RGBA
    } else {
        sys::AVIF_RGB_FORMAT_RGB
    };
    ensure(
        unsafe { sys::avifRGBImageAllocatePixels(&mut rgb) },
        sys::AVIF_RESULT_OK,
        "pixel allocation",
    )?;
    Ok(RgbPixels(rgb))
}

/// Decode an AVIF file into an 8-bit RGBA image.
pub fn decode(path: &Path) -> Result<DynamicImage, ConversionError> {
    let data = std::fs::read(path)?;
    if !is_avif(&data) {
        return Err(ConversionError::EncodeError(format!(
            "{:?} is not an AVIF file",
            path
        )));
    }

    unsafe {
        let decoder = Decoder(sys::avifDecoderCreate());
        if decoder.0.is_null() {
            return Err(failed("decoder creation"));
        }
        let image = AvifImage(sys::avifImageCreateEmpty());
        if image.0.is_null() {
            return Err(failed("image creation"));
        }

        ensure(
            sys::avifDecoderReadMemory(decoder.0, image.0, data.as_ptr(), data.len()),
            sys::AVIF_RESULT_OK,
            "decoding",
        )?;

        let (width, height) = ((*image.0).width, (*image.0).height);
        let mut rgb = rgb_pixels(&image, true)?;
        ensure(
            sys::avifImageYUVToRGB(image.0, &mut rgb.0),
            sys::AVIF_RESULT_OK,
            "YUV to RGB conversion",
        )?;

        let row_len = width as usize * 4;
        let stride = rgb.0.rowBytes as usize;
        let mut pixels = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let row = std::slice::from_raw_parts(rgb.0.pixels.add(y * stride), row_len);
            pixels.extend_from_slice(row);
        }

        let buffer = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(width, height, pixels)
            .ok_or_else(|| failed("pixel copy"))?;
        debug!("Decoded AVIF {:?}: {}x{}", path, width, height);
        Ok(DynamicImage::ImageRgba8(buffer))
    }
}

/// Encode `image` as 8-bit sRGB AVIF. Opaque images use 4:2:0 chroma, images
/// with alpha 4:4:4.
pub fn encode(image: &DynamicImage, quality: u8, speed: u8) -> Result<Vec<u8>, ConversionError> {
    let (width, height) = image.dimensions();
    let alpha = image.color().has_alpha();
    let (raw, channels) = if alpha {
        (image.to_rgba8().into_raw(), 4)
    } else {
        (image.to_rgb8().into_raw(), 3)
    };

    unsafe {
        let target = AvifImage(sys::avifImageCreate(
            width,
            height,
            8,
            if alpha {
                sys::AVIF_PIXEL_FORMAT_YUV444
            } else {
                sys::AVIF_PIXEL_FORMAT_YUV420
            },
        ));
        if target.0.is_null() {
            return Err(failed("image creation"));
        }

        (*target.0).colorPrimaries = sys::AVIF_COLOR_PRIMARIES_BT709 as u16;
        (*target.0).transferCharacteristics = sys::AVIF_TRANSFER_CHARACTERISTICS_SRGB as u16;
        (*target.0).matrixCoefficients = sys::AVIF_MATRIX_COEFFICIENTS_BT709 as u16;
        (*target.0).yuvRange = sys::AVIF_RANGE_FULL;

        sys::avifImageAllocatePlanes(target.0, sys::AVIF_PLANES_YUV);
        if alpha {
            sys::avifImageAllocatePlanes(target.0, sys::AVIF_PLANES_A);
        }

        {
            let rgb = rgb_pixels(&target, alpha)?;
            let row_len = width as usize * channels;
            let stride = rgb.0.rowBytes as usize;
            for (y, row) in raw.chunks_exact(row_len).enumerate() {
                std::ptr::copy_nonoverlapping(row.as_ptr(), rgb.0.pixels.add(y * stride), row_len);
            }
            ensure(
                sys::avifImageRGBToYUV(target.0, &rgb.0),
                sys::AVIF_RESULT_OK,
                "RGB to YUV conversion",
            )?;
        }

        let encoder = Encoder(sys::avifEncoderCreate());
        if encoder.0.is_null() {
            return Err(failed("encoder creation"));
        }
        (*encoder.0).quality = quality.min(100) as i32;
        (*encoder.0).qualityAlpha = quality.min(100) as i32;
        (*encoder.0).speed = speed.min(10) as i32;
        (*encoder.0).maxThreads = 1;

        let mut output = Output(sys::avifRWData::default());
        ensure(
            sys::avifEncoderWrite(encoder.0, target.0, &mut output.0),
            sys::AVIF_RESULT_OK,
            "encoding",
        )?;

        let data = std::slice::from_raw_parts(output.0.data, output.0.size).to_vec();
        debug!(
            "Encoded AVIF {}x{} at quality {} speed {}: {} bytes",
            width,
            height,
            quality,
            speed,
            data.len()
        );
        Ok(data)
    }
}
