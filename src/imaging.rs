//! Bitmap codec collaborator.
//!
//! The pipelines only need two things from an image library: turn a source file
//! into a canonical byte stream (8-bit RGB, PNG encoded) and turn such bytes back
//! into pixels. [`ImageCodec`] is that seam; [`RasterCodec`] implements it with the
//! `image` crate.

use crate::error::SorterError;
use image::{DynamicImage, ImageOutputFormat};
use std::io::Cursor;
use std::path::Path;

/// Decoded 8-bit RGB pixels, row-major, three bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixels {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Pixels {
    pub fn pixel_count(&self) -> usize {
        self.rgb.len() / 3
    }
}

pub trait ImageCodec: Send + Sync {
    /// Read `path` and re-encode it as canonical RGB bytes.
    ///
    /// Normalizing already-normalized bytes yields the same bytes.
    fn normalize(&self, path: &Path) -> Result<Vec<u8>, SorterError>;

    /// Decode canonical (or any supported) image bytes into RGB pixels.
    fn decode(&self, bytes: &[u8]) -> Result<Pixels, SorterError>;
}

/// [`ImageCodec`] backed by the `image` crate; output is PNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterCodec;

impl RasterCodec {
    pub fn new() -> Self {
        Self
    }
}

impl ImageCodec for RasterCodec {
    fn normalize(&self, path: &Path) -> Result<Vec<u8>, SorterError> {
        let img = image::open(path).map_err(|e| {
            SorterError::Image(format!("failed to open {}: {}", path.display(), e))
        })?;
        let rgb = match img {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };

        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(rgb).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Pixels, SorterError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        Ok(Pixels {
            width: rgb.width(),
            height: rgb.height(),
            rgb: rgb.into_raw(),
        })
    }
}
