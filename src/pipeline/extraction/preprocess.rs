//! Image preprocessing for recognition engines.
//!
//! Vision engines take the raw upload untouched. Offline text engines get an
//! ordered list of enhanced candidates (grayscale, contrast-stretched,
//! binarized) that the fallback chain tries until one yields plausible text.
//! Every transform is deterministic: the same bytes always produce the same variants.

use std::io::Cursor;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, ImageOutputFormat, Luma, RgbImage};
use tracing::debug;

use super::types::{ImageVariant, VariantKind};
use super::ExtractionError;
use crate::config::PipelineConfig;
use crate::models::EngineCapability;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Minimum valid image size in bytes (smallest valid PNG is ~67 bytes).
const MIN_IMAGE_BYTES: usize = 67;

/// Short side below which offline variants are upscaled 2x.
const UPSCALE_BELOW_PX: u32 = 1000;

/// Upscaling never pushes the long side past this.
const MAX_UPSCALED_PX: u32 = 4000;

/// Portrait photos of landscape cards: height > 1.2 x width.
const PORTRAIT_RATIO: f32 = 1.2;

/// Size bounds an upload must satisfy before any engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    pub max_bytes: usize,
    /// Longest allowed side of the decoded image, in pixels.
    pub max_dimension: u32,
}

impl InputLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_bytes: config.max_file_bytes,
            max_dimension: config.max_image_dimension,
        }
    }

    /// Byte-size check, then the header-declared dimensions.
    pub fn check(&self, bytes: &[u8]) -> Result<(), ExtractionError> {
        validate_image_bytes(bytes, self.max_bytes)?;
        validate_image_dimensions(bytes, self.max_dimension)
    }
}

// ═══════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════

/// Produce candidate images for an engine of the given capability.
///
/// Undecodable input still yields the raw bytes as the single variant so
/// engines that accept formats we cannot decode still get a chance.
pub fn variants_for(
    capability: EngineCapability,
    bytes: &Arc<[u8]>,
    limits: InputLimits,
) -> Result<Vec<ImageVariant>, ExtractionError> {
    limits.check(bytes)?;

    let original = ImageVariant {
        kind: VariantKind::Original,
        bytes: Arc::clone(bytes),
        mime_type: detect_mime_type(bytes),
    };

    if capability == EngineCapability::Vision {
        return Ok(vec![original]);
    }

    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            debug!(error = %e, "Image not decodable, offering raw bytes only");
            return Ok(vec![original]);
        }
    };

    let oriented = rotate_portrait(apply_orientation(decoded, read_exif_orientation(bytes)));
    let gray = upscale_if_small(rgb_to_gray(&oriented.to_rgb8()));
    debug!(
        width = gray.width(),
        height = gray.height(),
        contrast = compute_contrast_score(&gray),
        "Prepared offline recognition base image"
    );

    let stretched = stretch_contrast(&gray);
    let binary = binarize(&stretched);

    Ok(vec![
        gray_variant(VariantKind::Grayscale, &gray)?,
        gray_variant(VariantKind::ContrastStretched, &stretched)?,
        gray_variant(VariantKind::Binarized, &binary)?,
    ])
}

fn gray_variant(kind: VariantKind, img: &GrayImage) -> Result<ImageVariant, ExtractionError> {
    Ok(ImageVariant {
        kind,
        bytes: encode_png(img)?.into(),
        mime_type: "image/png",
    })
}

// ═══════════════════════════════════════════════════════════
// Orientation
// ═══════════════════════════════════════════════════════════

/// Read EXIF orientation tag from raw image bytes.
/// Returns 1 (normal) if no EXIF data or tag not present.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply EXIF orientation transform to a `DynamicImage`.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Identity cards and passport data pages are landscape; a tall photo is
/// assumed to be one turned on its side and rotated 90° counter-clockwise.
pub fn rotate_portrait(img: DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if h as f32 > w as f32 * PORTRAIT_RATIO {
        debug!(width = w, height = h, "Rotating portrait image");
        img.rotate270()
    } else {
        img
    }
}

// ═══════════════════════════════════════════════════════════
// Pixel transforms
// ═══════════════════════════════════════════════════════════

/// Convert RGB image to grayscale using ITU-R BT.601 luminance.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    let (w, h) = (rgb.width(), rgb.height());
    let mut gray = GrayImage::new(w, h);
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = (0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32) as u8;
        gray.put_pixel(x, y, Luma([luma]));
    }
    gray
}

/// Small photos lose thin glyph strokes; double them before offline OCR.
pub fn upscale_if_small(img: GrayImage) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    if w.min(h) >= UPSCALE_BELOW_PX || w.max(h).saturating_mul(2) > MAX_UPSCALED_PX {
        return img;
    }
    image::imageops::resize(&img, w * 2, h * 2, FilterType::CatmullRom)
}

/// Linear min/max stretch to the full 0-255 range.
pub fn stretch_contrast(img: &GrayImage) -> GrayImage {
    let (min, max) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if max <= min {
        return img.clone();
    }
    let range = (max - min) as f32;
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = ((p.0[0] - min) as f32 / range * 255.0).round() as u8;
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Global mean threshold: darker than mean → black, else white.
pub fn binarize(img: &GrayImage) -> GrayImage {
    let count = (img.width() as u64 * img.height() as u64).max(1);
    let mean = img.pixels().map(|p| p.0[0] as u64).sum::<u64>() / count;
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = if (p.0[0] as u64) < mean { 0 } else { 255 };
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Standard deviation of pixel intensities. Range 0-127.5.
/// Low contrast (< 25) indicates near-uniform image.
pub fn compute_contrast_score(img: &GrayImage) -> f32 {
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for pixel in img.pixels() {
        let val = pixel.0[0] as f64;
        sum += val;
        sum_sq += val * val;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64) - (mean * mean);
    variance.max(0.0).sqrt() as f32
}

// ═══════════════════════════════════════════════════════════
// Pure helper functions
// ═══════════════════════════════════════════════════════════

/// Validate image bytes before decoding.
pub fn validate_image_bytes(bytes: &[u8], max_bytes: usize) -> Result<(), ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::InvalidInput(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > max_bytes {
        return Err(ExtractionError::InvalidInput(format!(
            "Image data exceeds {}MB limit",
            max_bytes / (1024 * 1024)
        )));
    }
    Ok(())
}

/// Reject images whose header declares a side longer than `max_dimension`.
///
/// Only the header is read, so a decompression bomb is refused before any
/// pixel buffer is allocated. Headers we cannot read pass through; the
/// decoder downstream handles them.
pub fn validate_image_dimensions(bytes: &[u8], max_dimension: u32) -> Result<(), ExtractionError> {
    let dimensions = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)
        .and_then(|reader| reader.into_dimensions());

    match dimensions {
        Ok((width, height)) if width > max_dimension || height > max_dimension => {
            Err(ExtractionError::ImageProcessing(format!(
                "Image is {width}x{height}, exceeds {max_dimension}px limit"
            )))
        }
        Ok(_) => Ok(()),
        Err(e) => {
            debug!(error = %e, "Image header unreadable, skipping dimension check");
            Ok(())
        }
    }
}

/// MIME type from magic bytes; JPEG when unknown (phone photos).
pub fn detect_mime_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Tiff) => "image/tiff",
        Ok(ImageFormat::WebP) => "image/webp",
        _ => "image/jpeg",
    }
}

/// Encode a grayscale image as PNG bytes.
pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, ExtractionError> {
    let dynamic = DynamicImage::ImageLuma8(img.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}
