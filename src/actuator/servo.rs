use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{GateActuator, MAX_ANGLE};
use crate::config::ServoSettings;

/// Time the kernel needs to create the `pwmN` directory after an export.
const EXPORT_SETTLE: Duration = Duration::from_millis(100);

/// Hobby servo on a Linux sysfs PWM channel.
///
/// Each command writes the pulse width, keeps the pulse enabled for the settle
/// time so the horn reaches position, then disables the output. A detached servo
/// holds position mechanically and does not buzz.
pub struct ServoActuator {
    settings: ServoSettings,
    channel_dir: PathBuf,
    exported: bool,
}

impl ServoActuator {
    pub fn new(settings: ServoSettings) -> Result<Self> {
        let chip = Path::new(&settings.device);
        if !chip.is_dir() {
            return Err(anyhow!(
                "pwm chip {} not found (is the PWM overlay enabled?)",
                chip.display()
            ));
        }
        let channel_dir = chip.join(format!("pwm{}", settings.channel));
        Ok(Self {
            settings,
            channel_dir,
            exported: false,
        })
    }

    fn ensure_exported(&mut self) -> Result<()> {
        if self.exported {
            return Ok(());
        }
        if !self.channel_dir.is_dir() {
            let export = Path::new(&self.settings.device).join("export");
            std::fs::write(&export, self.settings.channel.to_string())
                .with_context(|| format!("export pwm channel via {}", export.display()))?;
            std::thread::sleep(EXPORT_SETTLE);
        }
        self.write_attr("period", u64::from(self.settings.period_us) * 1000)?;
        self.exported = true;
        log::info!(
            "servo: pwm channel {} ready (period {} us)",
            self.channel_dir.display(),
            self.settings.period_us
        );
        Ok(())
    }

    fn write_attr(&self, attr: &str, value: u64) -> Result<()> {
        let path = self.channel_dir.join(attr);
        std::fs::write(&path, value.to_string())
            .with_context(|| format!("write {} to {}", value, path.display()))
    }
}

/// Map an angle to a pulse width.
///
/// The angle is first mapped to a servo value in [-1, 1] (`angle / 90 - 1`), then
/// linearly onto `[min_pulse_us, max_pulse_us]`.
pub fn pulse_width_us(angle: u8, min_pulse_us: u32, max_pulse_us: u32) -> u32 {
    let value = (f64::from(angle.min(MAX_ANGLE)) / 90.0 - 1.0).clamp(-1.0, 1.0);
    let span = f64::from(max_pulse_us.saturating_sub(min_pulse_us));
    min_pulse_us + ((value + 1.0) / 2.0 * span).round() as u32
}

impl GateActuator for ServoActuator {
    fn name(&self) -> &'static str {
        "servo"
    }

    fn set_position(&mut self, angle: u8) -> Result<()> {
        self.ensure_exported()?;
        let pulse = pulse_width_us(angle, self.settings.min_pulse_us, self.settings.max_pulse_us);
        self.write_attr("duty_cycle", u64::from(pulse) * 1000)?;
        self.write_attr("enable", 1)?;
        log::info!("servo: {} degrees (pulse {} us)", angle.min(MAX_ANGLE), pulse);
        std::thread::sleep(self.settings.settle);
        self.write_attr("enable", 0)
    }
}
