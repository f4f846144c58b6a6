//! Thumbnail generation for uploaded photos.

use std::io::Cursor;
use std::path::Path;

use image::{codecs::jpeg::JpegEncoder, DynamicImage, GenericImageView};
use thiserror::Error;

/// Thumbnail failures. `Corrupted` is the signal that the source photo
/// itself cannot be decoded.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Thumbnail source is empty")]
    Empty,

    #[error("Source image is corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to encode thumbnail: {0}")]
    Encode(String),

    #[error("Failed to read thumbnail source: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for thumbnail generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailOptions {
    /// Bound for both output dimensions in pixels.
    pub max_dimension: u32,
    /// JPEG quality.
    pub jpeg_quality: u8,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            max_dimension: 200,
            jpeg_quality: 85,
        }
    }
}

/// Generated JPEG thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Generate a JPEG thumbnail from source bytes.
///
/// The image is resized to fit within `max_dimension` on both axes while
/// preserving aspect ratio. Images smaller than the bound are not upscaled.
pub fn generate_thumbnail(
    source_bytes: &[u8],
    options: ThumbnailOptions,
) -> Result<Thumbnail, ThumbnailError> {
    if source_bytes.is_empty() {
        return Err(ThumbnailError::Empty);
    }
    let bound = options.max_dimension.max(1);

    let source = image::load_from_memory(source_bytes)
        .map_err(|error| ThumbnailError::Corrupted(error.to_string()))?;

    let (source_width, source_height) = source.dimensions();
    let resized = if source_width <= bound && source_height <= bound {
        source
    } else {
        source.thumbnail(bound, bound)
    };
    // JPEG has no alpha channel
    let resized = DynamicImage::ImageRgb8(resized.to_rgb8());
    let (width, height) = resized.dimensions();

    let mut cursor = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut cursor, options.jpeg_quality)
        .encode_image(&resized)
        .map_err(|error| ThumbnailError::Encode(error.to_string()))?;

    Ok(Thumbnail {
        bytes: cursor.into_inner(),
        width,
        height,
    })
}

/// Generate a JPEG thumbnail from an image file.
pub fn generate_thumbnail_from_path(
    path: &Path,
    options: ThumbnailOptions,
) -> Result<Thumbnail, ThumbnailError> {
    let bytes = std::fs::read(path)?;
    generate_thumbnail(&bytes, options)
}
