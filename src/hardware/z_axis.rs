//! Z axis of the sensor carriage: homing against the limit switch and
//! relative moves from the homed reference.
//!
//! The stepper has no position feedback, so a Z position is only trusted
//! after [`ZAxis::home`] has driven the carriage up onto the limit switch.
//! Positions are measured downwards from that switch, in mm.

use crate::error::{BenchError, BenchResult};
use crate::hardware::gpio::InputLine;
use crate::hardware::stepper::{Direction, StepperDriver};
use crate::timing::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Velocities and limits of the Z axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ZAxisSettings {
    /// Velocity while seeking the limit switch, mm/s
    pub reference_velocity_mm_s: f64,
    /// Velocity of ordinary moves, mm/s
    pub move_velocity_mm_s: f64,
    /// Give up homing after this long; `None` waits forever
    pub homing_timeout: Option<Duration>,
}

impl Default for ZAxisSettings {
    fn default() -> Self {
        Self {
            reference_velocity_mm_s: 5.0,
            move_velocity_mm_s: 15.0,
            homing_timeout: None,
        }
    }
}

pub struct ZAxis {
    motor: StepperDriver,
    limit_switch: Box<dyn InputLine>,
    clock: Arc<dyn Clock>,
    settings: ZAxisSettings,
}

impl ZAxis {
    pub fn new(
        motor: StepperDriver,
        limit_switch: Box<dyn InputLine>,
        clock: Arc<dyn Clock>,
        settings: ZAxisSettings,
    ) -> Self {
        Self {
            motor,
            limit_switch,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &ZAxisSettings {
        &self.settings
    }

    pub fn motor(&self) -> &StepperDriver {
        &self.motor
    }

    /// Drive the carriage up one pulse at a time until the limit switch reads
    /// pressed, and return the new reference position (always 0 mm).
    ///
    /// The switch is polled before the first pulse, so homing an already
    /// homed axis emits no pulse. `abort` is polled before every pulse; when
    /// it returns true the torque is released and `None` is returned. Without
    /// a configured timeout or an abort, a stuck or disconnected switch blocks
    /// forever.
    pub fn home(&mut self, hold_torque: bool, abort: &dyn Fn() -> bool) -> BenchResult<Option<f64>> {
        info!("Stepper motor Z referencing...");

        let period = self
            .motor
            .profile()
            .pulse_period(Some(self.settings.reference_velocity_mm_s));
        self.motor.set_direction(Direction::Backward)?;
        self.motor.enable_torque()?;

        let start = self.clock.now();
        let mut pulses: u64 = 0;
        while !self.limit_switch.is_high()? {
            if abort() {
                self.motor.release_torque()?;
                warn!("Z referencing aborted after {} pulses", pulses);
                return Ok(None);
            }
            if let Some(limit) = self.settings.homing_timeout {
                let elapsed = self.clock.now() - start;
                if elapsed > limit {
                    self.motor.release_torque()?;
                    return Err(BenchError::HomingTimeout { elapsed });
                }
            }
            self.motor.step_once(period)?;
            pulses += 1;
        }

        if !hold_torque {
            self.motor.release_torque()?;
        }
        debug!("Z reference reached after {} pulses", pulses);
        Ok(Some(0.0))
    }

    /// Move from `current_mm` to `target_mm` and return the new position.
    ///
    /// A move to the current position emits nothing.
    pub fn move_to(&mut self, current_mm: f64, target_mm: f64, hold_torque: bool) -> BenchResult<f64> {
        let distance = target_mm - current_mm;
        if distance == 0.0 {
            debug!("Z already at {} mm, skipping move", target_mm);
            return Ok(target_mm);
        }
        debug!(
            "Z moving from {} mm to {} mm ({} mm)",
            current_mm, target_mm, distance
        );
        self.motor
            .move_linear(distance, self.settings.move_velocity_mm_s, hold_torque)?;
        Ok(target_mm)
    }

    pub fn release_torque(&mut self) -> BenchResult<()> {
        self.motor.release_torque()
    }
}
