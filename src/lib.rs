//! Helmet-gated entry control.
//!
//! A camera watches the entrance; when a hard hat is detected the gate servo
//! opens, holds for a dwell period, and closes again once nobody wearing one is in
//! view. Operators watch the annotated live stream and can force the gate over
//! HTTP.
//!
//! # Module Structure
//!
//! - `ingest`: camera sources (synthetic, HTTP MJPEG, V4L2)
//! - `detect`: detector backends (color threshold, ONNX via tract)
//! - `gate`: the gate state machine and manual override
//! - `actuator`: servo drivers
//! - `pipeline`: the frame processing loop
//! - `publisher`: latest-frame hand-off to stream viewers
//! - `overlay`: status text on published frames
//! - `reporter`: best-effort event upload to the log backend
//! - `api`: HTTP stream, status and gate control
//! - `config`: file and environment configuration

pub mod actuator;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod publisher;
pub mod reporter;

pub use actuator::{open_actuator, GateActuator, ServoActuator, StubActuator};
pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use config::GateConfig;
pub use detect::{load_detector, Detection, Detector};
pub use frame::Frame;
pub use gate::{GateCommand, GateController, GateState, GateStatus, Transition};
pub use ingest::{open_source, FrameSource, SourceStats};
pub use pipeline::{CycleReport, FrameLoop, LoopHandle, RuntimeFlags};
pub use publisher::{FramePublisher, PublishedFrame};
pub use reporter::{EventReporter, GateEvent, HttpEventReporter, NullReporter};
