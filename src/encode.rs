//! Still-image compression.
//!
//! [`ImageEncoder`] turns an interleaved RGB buffer into a standard image
//! file. [`PngEncoder`] is the default implementation, backed by the
//! [`image`] crate.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage};

use crate::error::FrameServeError;

/// Compresses interleaved 8-bit RGB pixels.
pub trait ImageEncoder {
    /// MIME type written into each part's `Content-Type` header.
    fn content_type(&self) -> &'static str;

    /// File extension used in each part's filename.
    fn extension(&self) -> &'static str;

    /// Compress `rgb` (`width * height * 3` bytes, row-major).
    fn encode(&self, rgb: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, FrameServeError>;
}

/// Lossless PNG output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngEncoder;

impl ImageEncoder for PngEncoder {
    fn content_type(&self) -> &'static str {
        "image/png"
    }

    fn extension(&self) -> &'static str {
        "png"
    }

    fn encode(&self, rgb: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, FrameServeError> {
        let image = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
            FrameServeError::InvalidPicture(format!(
                "RGB buffer does not match {width}x{height} picture"
            ))
        })?;

        let mut output = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image).write_to(&mut output, ImageFormat::Png)?;
        Ok(output.into_inner())
    }
}
