use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// `detect` receives a frame already downscaled to `input_size()`. Implementations
/// must not retain the frame beyond the call.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Width and height the processing loop downsizes frames to.
    fn input_size(&self) -> (u32, u32);

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// One-time load hook, called before the first `detect`.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// True once the model is loaded and `detect` may be called.
    fn is_ready(&self) -> bool {
        true
    }
}
