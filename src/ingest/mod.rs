//! Camera frame sources.
//!
//! - Synthetic scene for `stub://` URLs (tests and bench setups)
//! - HTTP MJPEG or JPEG snapshot cameras
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Sources hand each captured `Frame` to the processing loop and keep nothing
//! beyond their own decode buffers.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::config::CameraSettings;
use crate::frame::Frame;

mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A camera the processing loop can pull frames from.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Open the device or stream. Called once before the first capture; sources
    /// that lose their connection reconnect on the next capture.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn capture_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Capture counters for a source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub capture_errors: u64,
    pub source: String,
}

/// Build the source selected by `settings.url`.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_settings(settings)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(MjpegSource::new(url, settings.target_fps)));
    }
    if url.starts_with("/dev/") {
        return open_device(settings);
    }
    Err(anyhow!(
        "unsupported camera url '{}'; expected stub://, http(s):// or /dev/video*",
        url
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(settings.clone())))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera {} requires the ingest-v4l2 feature",
        settings.url
    ))
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// How long a source may go without a frame before it reports unhealthy.
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}
