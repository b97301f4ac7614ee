//! Gate state machine.
//!
//! `GateController` is the only writer of the gate state and the manual-override
//! flag. Every read and write goes through one mutex, and the actuator is commanded
//! while that mutex is held, so an HTTP status read never observes a transition
//! half applied.
//!
//! Automatic transitions:
//!
//! | state   | helmet | action                                   |
//! |---------|--------|------------------------------------------|
//! | closed  | yes    | open, report event, hold for the dwell   |
//! | open    | no     | close                                    |
//! | holding | any    | nothing until the dwell expires          |
//!
//! The recorded state is the commanded state. An actuator error is logged and
//! counted but does not roll the state back.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::actuator::GateActuator;
use crate::config::GateSettings;
use crate::detect::{contains_label, Detection};
use crate::frame::Frame;
use crate::reporter::{EventReporter, GateEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Closed,
    Open,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Closed => "closed",
            GateState::Open => "open",
        }
    }
}

/// Operator command from the HTTP API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateCommand {
    Open,
    Close,
}

impl FromStr for GateCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(GateCommand::Open),
            "close" => Ok(GateCommand::Close),
            other => Err(anyhow!("unknown gate action '{}'", other)),
        }
    }
}

/// Consistent snapshot of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateStatus {
    pub state: GateState,
    pub manual_override: bool,
    /// Actuator commands that failed since startup.
    pub actuator_faults: u64,
}

/// Transition caused by an automatic evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Closed,
    /// Automatically opened; detections are ignored until `until`.
    Holding { until: Instant },
    Open,
}

impl Phase {
    fn state(&self) -> GateState {
        match self {
            Phase::Closed => GateState::Closed,
            Phase::Holding { .. } | Phase::Open => GateState::Open,
        }
    }
}

struct GateInner {
    phase: Phase,
    manual_override: bool,
    actuator: Box<dyn GateActuator>,
    actuator_faults: u64,
}

impl GateInner {
    fn status(&self) -> GateStatus {
        GateStatus {
            state: self.phase.state(),
            manual_override: self.manual_override,
            actuator_faults: self.actuator_faults,
        }
    }

    fn command(&mut self, angle: u8) {
        if let Err(err) = self.actuator.set_position(angle) {
            self.actuator_faults += 1;
            log::warn!(
                "gate: {} actuator failed to reach {} degrees: {:#}",
                self.actuator.name(),
                angle,
                err
            );
        }
    }
}

pub struct GateController {
    inner: Mutex<GateInner>,
    reporter: Arc<dyn EventReporter>,
    settings: GateSettings,
    target_label: String,
}

impl GateController {
    /// Create a controller in the closed, automatic state. The actuator is not
    /// commanded until the first transition; callers drive it closed beforehand.
    pub fn new(
        actuator: Box<dyn GateActuator>,
        reporter: Arc<dyn EventReporter>,
        settings: GateSettings,
    ) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                phase: Phase::Closed,
                manual_override: false,
                actuator,
                actuator_faults: 0,
            }),
            reporter,
            settings,
            target_label: "helmet".to_string(),
        }
    }

    /// Label whose presence opens the gate.
    pub fn with_target_label(mut self, label: impl Into<String>) -> Self {
        self.target_label = label.into();
        self
    }

    pub fn target_label(&self) -> &str {
        &self.target_label
    }

    fn lock(&self) -> Result<MutexGuard<'_, GateInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("gate state lock poisoned"))
    }

    pub fn status(&self) -> Result<GateStatus> {
        Ok(self.lock()?.status())
    }

    /// Apply one cycle's detections. Ignored while in manual override.
    pub fn evaluate_detection(
        &self,
        detections: &[Detection],
        frame: &Frame,
    ) -> Result<Option<Transition>> {
        let helmet_present = contains_label(detections, &self.target_label);
        self.evaluate_at(Instant::now(), helmet_present, frame)
    }

    pub(crate) fn evaluate_at(
        &self,
        now: Instant,
        helmet_present: bool,
        frame: &Frame,
    ) -> Result<Option<Transition>> {
        let transition = {
            let mut inner = self.lock()?;
            if inner.manual_override {
                return Ok(None);
            }
            if let Phase::Holding { until } = inner.phase {
                if now < until {
                    return Ok(None);
                }
                inner.phase = Phase::Open;
            }
            match (inner.phase, helmet_present) {
                (Phase::Closed, true) => {
                    inner.command(self.settings.open_angle);
                    inner.phase = Phase::Holding {
                        until: now + self.settings.dwell,
                    };
                    Some(Transition::Opened)
                }
                (Phase::Open, false) => {
                    inner.command(self.settings.closed_angle);
                    inner.phase = Phase::Closed;
                    Some(Transition::Closed)
                }
                _ => None,
            }
        };

        match transition {
            Some(Transition::Opened) => {
                log::info!("gate: {} detected, opened", self.target_label);
                self.reporter.report(GateEvent::new(frame.clone(), true));
            }
            Some(Transition::Closed) => {
                log::info!("gate: {} no longer present, closed", self.target_label);
            }
            None => {}
        }
        Ok(transition)
    }

    /// Force the gate from an operator command.
    ///
    /// The actuator is always re-commanded, even if the gate is already in the
    /// requested state. `Open` enters manual override; `Close` returns control to
    /// automatic detection.
    pub fn apply_manual_command(&self, cmd: GateCommand) -> Result<GateStatus> {
        let mut inner = self.lock()?;
        match cmd {
            GateCommand::Open => {
                inner.manual_override = true;
                inner.command(self.settings.open_angle);
                inner.phase = Phase::Open;
            }
            GateCommand::Close => {
                inner.command(self.settings.closed_angle);
                inner.phase = Phase::Closed;
                inner.manual_override = false;
            }
        }
        let status = inner.status();
        log::info!(
            "gate: manual {:?} -> {} (manual_mode={})",
            cmd,
            status.state.as_str(),
            status.manual_override
        );
        Ok(status)
    }

    /// Close the gate for process shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.command(self.settings.closed_angle);
        inner.phase = Phase::Closed;
        inner.manual_override = false;
        log::info!("gate: closed for shutdown");
        Ok(())
    }
}
