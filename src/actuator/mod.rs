//! Gate actuators.
//!
//! The gate controller commands an angle in degrees (0..=180). Implementations:
//! - `ServoActuator`: hobby servo driven through Linux sysfs PWM
//! - `StubActuator`: records commands (bench setups and tests)

mod servo;
mod stub;

use anyhow::Result;

use crate::config::ServoSettings;

pub use servo::{pulse_width_us, ServoActuator};
pub use stub::StubActuator;

/// Largest angle an actuator accepts.
pub const MAX_ANGLE: u8 = 180;

/// Physical gate actuator.
pub trait GateActuator: Send {
    /// Actuator identifier for logs.
    fn name(&self) -> &'static str;

    /// Move to `angle` degrees. May block for the mechanical settle time.
    fn set_position(&mut self, angle: u8) -> Result<()>;
}

/// Build the actuator named by `settings.device`.
pub fn open_actuator(settings: &ServoSettings) -> Result<Box<dyn GateActuator>> {
    if settings.device.starts_with("stub://") {
        log::info!("actuator: using stub servo {}", settings.device);
        Ok(Box::new(StubActuator::new()))
    } else {
        Ok(Box::new(ServoActuator::new(settings.clone())?))
    }
}
