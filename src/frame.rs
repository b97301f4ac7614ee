//! Captured camera frames.
//!
//! A `Frame` is an RGB raster plus its capture time. Sources hand ownership of a
//! frame to the processing loop for one cycle; the loop downsizes a copy for the
//! detector, annotates the full-resolution frame and encodes it for publishing.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

/// Upper bound on a single JPEG we are willing to decode from a camera.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Wall-clock capture time (used for the overlay and event reports).
    pub captured_at: DateTime<Local>,
    /// Per-source capture counter.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Local::now(),
            sequence,
        }
    }

    /// Build a frame from packed RGB24 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("rgb buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    /// Decode a JPEG into a frame.
    pub fn decode_jpeg(bytes: &[u8], sequence: u64) -> Result<Self> {
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg of {} bytes exceeds limit", bytes.len()));
        }
        let decoded = image::load_from_memory(bytes).context("decode jpeg")?;
        Ok(Self::new(decoded.into_rgb8(), sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB24 pixel data, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Downscaled copy for detector input. Keeps the capture metadata.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        Frame {
            image: image::imageops::resize(&self.image, width, height, FilterType::Triangle),
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }

    /// Encode as baseline JPEG at the given quality (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.pixels().len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode_image(&self.image)
            .context("encode jpeg")?;
        Ok(out)
    }
}
