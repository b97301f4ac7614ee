use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{GateActuator, MAX_ANGLE};

/// Commands kept in the history; older ones are discarded.
const HISTORY_LIMIT: usize = 256;

/// Actuator that only records and logs the commanded angles.
///
/// Clones share the same command history, so a test can keep one clone while the
/// gate controller owns another.
#[derive(Clone, Default)]
pub struct StubActuator {
    commands: Arc<Mutex<Vec<u8>>>,
}

impl StubActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent commanded angles (up to 256), oldest first.
    pub fn commands(&self) -> Vec<u8> {
        self.commands
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl GateActuator for StubActuator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn set_position(&mut self, angle: u8) -> Result<()> {
        let angle = angle.min(MAX_ANGLE);
        log::info!("stub servo: {} degrees", angle);
        let mut commands = self
            .commands
            .lock()
            .map_err(|_| anyhow!("stub actuator lock poisoned"))?;
        if commands.len() == HISTORY_LIMIT {
            commands.remove(0);
        }
        commands.push(angle);
        Ok(())
    }
}
