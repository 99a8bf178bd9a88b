#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Deterministic image optimization: validate, resize to a maximum edge,
//! recompress, and optionally convert large PNGs to JPEG.
//!
//! The transformation is a pure function of the input bytes. Small, in-spec
//! inputs pass through untouched so re-running the optimizer is a no-op.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

/// Inputs at or below this byte size skip recompression.
pub const MAX_IMAGE_SIZE: usize = 2 * 1024 * 1024;

/// Longest allowed edge; larger images are scaled down to exactly this.
pub const MAX_IMAGE_DIMENSION: u32 = 2048;

/// JPEG encode quality.
pub const JPEG_QUALITY: u8 = 85;

/// PNGs above this byte size are converted to JPEG when recompressed.
pub const PNG_TO_JPEG_THRESHOLD: usize = 512 * 1024;

/// The two formats the pipeline works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
}

impl ImageKind {
    /// Lowercase format name.
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpeg",
            ImageKind::Png => "png",
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one optimization pass.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Output bytes, ready for the vision stage.
    pub bytes: Vec<u8>,
    /// Input size in bytes.
    pub original_size: usize,
    /// Output size in bytes; always equals `bytes.len()`.
    pub optimized_size: usize,
    /// Detected input format.
    pub original_format: ImageKind,
    /// Output format; differs from the input only for PNG→JPEG conversion.
    pub optimized_format: ImageKind,
    /// Whether the image was scaled down.
    pub was_resized: bool,
    /// Whether the image was re-encoded.
    pub was_compressed: bool,
    /// Whether a PNG was converted to JPEG.
    pub was_converted: bool,
    /// `optimized_size / original_size`.
    pub compression_ratio: f64,
}

/// Optimizer failures.
#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    /// The input was empty.
    #[error("empty image input")]
    InvalidInput,
    /// The input is not a JPEG or PNG.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    /// The header claimed JPEG/PNG but the body failed to decode.
    #[error("decode image: {0}")]
    Decode(#[source] image::ImageError),
    /// Re-encoding failed.
    #[error("encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Optimize `input` for the vision stage.
///
/// Inputs that are already within [`MAX_IMAGE_SIZE`] and
/// [`MAX_IMAGE_DIMENSION`] are returned byte-identical with a compression
/// ratio of 1.0. Everything else is scaled down to the maximum edge
/// (Lanczos, aspect preserved) and re-encoded: JPEG at quality 85, PNG at
/// maximum lossless compression, with PNGs above
/// [`PNG_TO_JPEG_THRESHOLD`] converted to JPEG.
pub fn optimize(input: &[u8]) -> Result<OptimizationResult, OptimizeError> {
    if input.is_empty() {
        return Err(OptimizeError::InvalidInput);
    }

    let format = image::guess_format(input)
        .map_err(|_| OptimizeError::UnsupportedFormat("unknown".to_string()))?;
    let original_format = match format {
        ImageFormat::Jpeg => ImageKind::Jpeg,
        ImageFormat::Png => ImageKind::Png,
        other => {
            return Err(OptimizeError::UnsupportedFormat(
                other.extensions_str().first().copied().unwrap_or("?").to_string(),
            ));
        }
    };

    let img = image::load_from_memory_with_format(input, format).map_err(OptimizeError::Decode)?;
    let (width, height) = (img.width(), img.height());
    let original_size = input.len();

    if original_size <= MAX_IMAGE_SIZE && width.max(height) <= MAX_IMAGE_DIMENSION {
        return Ok(OptimizationResult {
            bytes: input.to_vec(),
            original_size,
            optimized_size: original_size,
            original_format,
            optimized_format: original_format,
            was_resized: false,
            was_compressed: false,
            was_converted: false,
            compression_ratio: 1.0,
        });
    }

    let (img, was_resized) = if width.max(height) > MAX_IMAGE_DIMENSION {
        let (new_width, new_height) = scaled_dimensions(width, height);
        (
            img.resize_exact(new_width, new_height, FilterType::Lanczos3),
            true,
        )
    } else {
        (img, false)
    };

    let optimized_format =
        if original_format == ImageKind::Png && original_size > PNG_TO_JPEG_THRESHOLD {
            ImageKind::Jpeg
        } else {
            original_format
        };
    let was_converted = optimized_format != original_format;

    let bytes = encode(&img, optimized_format)?;
    let optimized_size = bytes.len();

    Ok(OptimizationResult {
        bytes,
        original_size,
        optimized_size,
        original_format,
        optimized_format,
        was_resized,
        was_compressed: true,
        was_converted,
        compression_ratio: optimized_size as f64 / original_size as f64,
    })
}

/// New dimensions with the longer edge at exactly [`MAX_IMAGE_DIMENSION`]
/// and the shorter edge rounded to preserve aspect ratio.
fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    let max = MAX_IMAGE_DIMENSION as f64;
    if width >= height {
        let new_height = (height as f64 * max / width as f64).round() as u32;
        (MAX_IMAGE_DIMENSION, new_height.max(1))
    } else {
        let new_width = (width as f64 * max / height as f64).round() as u32;
        (new_width.max(1), MAX_IMAGE_DIMENSION)
    }
}

fn encode(img: &DynamicImage, kind: ImageKind) -> Result<Vec<u8>, OptimizeError> {
    let mut out = Vec::new();
    match kind {
        ImageKind::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = img.to_rgb8();
            let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), JPEG_QUALITY);
            rgb.write_with_encoder(encoder).map_err(OptimizeError::Encode)?;
        }
        ImageKind::Png => {
            let encoder = PngEncoder::new_with_quality(
                Cursor::new(&mut out),
                CompressionType::Best,
                PngFilterType::Adaptive,
            );
            img.write_with_encoder(encoder).map_err(OptimizeError::Encode)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = gradient(width, height);
        let mut out = Vec::new();
        img.write_with_encoder(JpegEncoder::new_with_quality(Cursor::new(&mut out), 90))
            .unwrap();
        out
    }

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        img.write_with_encoder(PngEncoder::new(Cursor::new(&mut out)))
            .unwrap();
        out
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    // Incompressible pixel data, so PNG size tracks raw size.
    fn noise(width: u32, height: u32) -> RgbImage {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        RgbImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let b = (state >> 33) as u32;
            image::Rgb([(b & 0xff) as u8, ((b >> 8) & 0xff) as u8, ((b >> 16) & 0xff) as u8])
        })
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(optimize(&[]), Err(OptimizeError::InvalidInput)));
    }

    #[test]
    fn unknown_bytes_are_unsupported() {
        let err = optimize(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, OptimizeError::UnsupportedFormat(_)));
    }

    #[test]
    fn gif_is_unsupported() {
        // Minimal GIF89a header; format detection is all that matters here.
        let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";
        let err = optimize(gif).unwrap_err();
        assert!(matches!(err, OptimizeError::UnsupportedFormat(_)));
    }

    #[test]
    fn small_input_passes_through_unchanged() {
        let input = jpeg_bytes(500, 500);
        assert!(input.len() <= MAX_IMAGE_SIZE);

        let result = optimize(&input).unwrap();
        assert_eq!(result.bytes, input);
        assert!(!result.was_resized);
        assert!(!result.was_compressed);
        assert!(!result.was_converted);
        assert_eq!(result.compression_ratio, 1.0);
        assert_eq!(result.optimized_size, result.bytes.len());
        assert_eq!(result.original_format, ImageKind::Jpeg);
        assert_eq!(result.optimized_format, ImageKind::Jpeg);
    }

    #[test]
    fn landscape_resizes_to_max_width() {
        let input = jpeg_bytes(3000, 1500);
        let result = optimize(&input).unwrap();
        assert!(result.was_resized);
        assert!(result.was_compressed);

        let out = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(out.width(), 2048);
        assert_eq!(out.height(), 1024);
        assert_eq!(result.optimized_size, result.bytes.len());
    }

    #[test]
    fn portrait_resizes_to_max_height() {
        let input = jpeg_bytes(1500, 3000);
        let result = optimize(&input).unwrap();
        assert!(result.was_resized);

        let out = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(out.width(), 1024);
        assert_eq!(out.height(), 2048);
    }

    #[test]
    fn square_resizes_to_max_both() {
        let input = jpeg_bytes(3000, 3000);
        let result = optimize(&input).unwrap();

        let out = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(out.width(), 2048);
        assert_eq!(out.height(), 2048);
    }

    #[test]
    fn rounding_preserves_aspect_ratio() {
        assert_eq!(scaled_dimensions(4096, 2048), (2048, 1024));
        assert_eq!(scaled_dimensions(3000, 2000), (2048, 1365));
        assert_eq!(scaled_dimensions(2000, 3000), (1365, 2048));
        assert_eq!(scaled_dimensions(2049, 1), (2048, 1));
    }

    #[test]
    fn large_png_converts_to_jpeg() {
        let input = png_bytes(&noise(2200, 2200));
        assert!(input.len() > PNG_TO_JPEG_THRESHOLD);

        let result = optimize(&input).unwrap();
        assert!(result.was_resized);
        assert!(result.was_converted);
        assert_eq!(result.original_format, ImageKind::Png);
        assert_eq!(result.optimized_format, ImageKind::Jpeg);
        assert!(result.optimized_size < result.original_size);
        assert!(
            (result.compression_ratio
                - result.optimized_size as f64 / result.original_size as f64)
                .abs()
                < f64::EPSILON
        );
        assert_eq!(
            image::guess_format(&result.bytes).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn oversized_png_without_resize_still_converts() {
        // Dimensions are under the cap but the byte size is not, so the
        // encode path runs without the resize step.
        let input = png_bytes(&noise(1024, 1024));
        assert!(input.len() > MAX_IMAGE_SIZE);

        let result = optimize(&input).unwrap();
        assert!(!result.was_resized);
        assert!(result.was_compressed);
        assert!(result.was_converted);
        assert_eq!(result.optimized_format, ImageKind::Jpeg);
    }

    #[test]
    fn optimizing_twice_is_idempotent_for_small_inputs() {
        let input = jpeg_bytes(400, 300);
        let first = optimize(&input).unwrap();
        let second = optimize(&first.bytes).unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert!(!second.was_compressed);
    }
}
