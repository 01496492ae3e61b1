//! Transform engine: decode, resize, re-encode.
//!
//! This is the CPU-heavy stage. Callers run it on the blocking pool so a
//! slow decode never stalls the request-accepting path. Decode faults are
//! isolated per request - a corrupt payload fails that request only.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use thiserror::Error;
use tracing::debug;

use super::detect::ImageFormat;
use super::fetch::FetchResult;

/// Upper bound on the decoded RGBA buffer, as a multiple of the configured
/// max payload size. Rejects decompression bombs before the full decode.
const DECODED_SIZE_FACTOR: u64 = 32;

/// Errors from image transformation.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("image decode failed: {0}")]
    Decode(image::ImageError),

    #[error("decoded image too large: {width}x{height} exceeds pixel budget")]
    TooLarge { width: u32, height: u32 },

    #[error("image encode failed: {0}")]
    Encode(image::ImageError),
}

/// A transformed image ready to serve or persist.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl TransformedImage {
    /// MIME type of the encoded bytes.
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

fn to_codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Gif => image::ImageFormat::Gif,
        ImageFormat::Webp => image::ImageFormat::WebP,
    }
}

/// Target dimensions for a resize, per the documented policy:
/// one dimension given preserves aspect ratio, both given are exact.
fn target_dimensions(
    orig_width: u32,
    orig_height: u32,
    target_width: Option<u32>,
    target_height: Option<u32>,
) -> Option<(u32, u32)> {
    match (target_width, target_height) {
        (None, None) => None,
        (Some(w), Some(h)) => Some((w, h)),
        (Some(w), None) => {
            let h = (orig_height as u64 * w as u64 + orig_width as u64 / 2) / orig_width as u64;
            Some((w, (h as u32).max(1)))
        }
        (None, Some(h)) => {
            let w = (orig_width as u64 * h as u64 + orig_height as u64 / 2) / orig_height as u64;
            Some(((w as u32).max(1), h))
        }
    }
}

/// Decode `input`, apply the resize policy, and re-encode.
///
/// `max_payload_bytes` is the configured origin payload limit; the decoded
/// pixel buffer is bounded relative to it. Quality applies to lossy output
/// (JPEG); PNG, GIF and WEBP encode losslessly and ignore it.
pub fn transform(
    input: &FetchResult,
    format: ImageFormat,
    output_format: ImageFormat,
    target_width: Option<u32>,
    target_height: Option<u32>,
    quality: u8,
    max_payload_bytes: u64,
) -> Result<TransformedImage, TransformError> {
    let reader = ImageReader::with_format(Cursor::new(&input.bytes), to_codec_format(format));

    // Header-only dimension probe before committing to a full decode.
    let (orig_width, orig_height) = reader.into_dimensions().map_err(TransformError::Decode)?;
    let decoded_bytes = orig_width as u64 * orig_height as u64 * 4;
    if decoded_bytes > max_payload_bytes.saturating_mul(DECODED_SIZE_FACTOR) {
        return Err(TransformError::TooLarge {
            width: orig_width,
            height: orig_height,
        });
    }

    let img = ImageReader::with_format(Cursor::new(&input.bytes), to_codec_format(format))
        .decode()
        .map_err(TransformError::Decode)?;

    let img = match target_dimensions(orig_width, orig_height, target_width, target_height) {
        Some((w, h)) => {
            debug!(
                from = format!("{orig_width}x{orig_height}"),
                to = format!("{w}x{h}"),
                "Resizing image"
            );
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        None => img,
    };

    let (width, height) = (img.width(), img.height());
    let bytes = encode(&img, output_format, quality)?;

    Ok(TransformedImage {
        bytes,
        format: output_format,
        width,
        height,
    })
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Bytes, TransformError> {
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = img.to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut out, quality);
            rgb.write_with_encoder(encoder)
                .map_err(TransformError::Encode)?;
        }
        ImageFormat::Webp => {
            // The WEBP encoder only accepts RGB(A) input.
            let rgba = img.to_rgba8();
            let encoder = WebPEncoder::new_lossless(&mut out);
            rgba.write_with_encoder(encoder)
                .map_err(TransformError::Encode)?;
        }
        ImageFormat::Gif => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut out, image::ImageFormat::Gif)
                .map_err(TransformError::Encode)?;
        }
        ImageFormat::Png => {
            img.write_to(&mut out, image::ImageFormat::Png)
                .map_err(TransformError::Encode)?;
        }
    }
    Ok(Bytes::from(out.into_inner()))
}
