pub mod color;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use color::ColorDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;
