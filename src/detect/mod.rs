//! Object detection.
//!
//! The processing loop only needs one answer from a detector: the set of labelled
//! regions in a frame. Backends are selected by name from configuration and loaded
//! once at startup.

mod backend;
mod backends;
mod result;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

pub use backend::Detector;
pub use backends::ColorDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use result::{contains_label, BoundingBox, Detection};

/// Instantiate the configured detector backend.
///
/// The returned detector has not been warmed up yet; the processing loop does
/// that once before its first cycle.
pub fn load_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    match settings.backend.as_str() {
        "color" => Ok(Box::new(ColorDetector::new(
            settings.target_label.clone(),
            settings.input_size,
        ))),
        #[cfg(feature = "backend-tract")]
        "tract" => Ok(Box::new(TractDetector::new(
            &settings.model_path,
            settings.input_size,
            settings.labels.clone(),
        )?
        .with_threshold(settings.confidence_threshold))),
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!("detector 'tract' requires the backend-tract feature")),
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}
