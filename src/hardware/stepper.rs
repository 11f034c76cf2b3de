//! Step/direction pulse generation for the two bench steppers.
//!
//! A [`StepperDriver`] owns the direction, step and enable lines of one
//! driver. It converts a requested velocity and the motor's mechanics into a
//! pulse period, then emits a bounded train of pulses, each one held for the
//! profile's minimum pulse width and padded to the full period with a
//! busy-wait on the shared [`Clock`].
//!
//! The enable line is active low: low engages the holding torque.

use crate::error::{BenchError, BenchResult};
use crate::hardware::gpio::MotorLines;
use crate::timing::Clock;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Level of the direction line for a pulse train.
///
/// On the Z axis `Forward` moves the carriage down, away from the limit switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Direction line high.
    Forward,
    /// Direction line low.
    #[default]
    Backward,
}

impl Direction {
    fn line_level(self) -> bool {
        matches!(self, Direction::Forward)
    }
}

/// Immutable mechanical and wiring description of one stepper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorProfile {
    /// Free-text description
    pub info: String,
    /// Angle of one full step, degrees
    pub step_angle_deg: f64,
    /// Gearbox ratio, if any
    #[serde(default)]
    pub gear_ratio: Option<f64>,
    /// Steps for a full revolution
    pub steps_per_revolution: u32,
    /// Target revolutions per second for rotary moves
    pub revolutions_per_second: f64,
    /// Pulley diameter for linear axes, mm
    #[serde(default)]
    pub pulley_diameter_mm: Option<f64>,
    /// GPIO offset of the direction line
    pub dir_line: u32,
    /// GPIO offset of the step line
    pub step_line: u32,
    /// GPIO offset of the enable line
    pub enable_line: u32,
    /// Minimum width of the step pulse, microseconds
    pub pulse_width_us: u64,
    /// Direction used for unsigned moves (shaft rotation)
    #[serde(default)]
    pub direction: Direction,
}

impl MotorProfile {
    /// Shaft stepper of the bench: 1.8° steps through a 1:6 reducer.
    pub fn shaft() -> Self {
        Self {
            info: "Stepper motor connected to the shaft".to_string(),
            step_angle_deg: 1.8,
            gear_ratio: Some(6.0),
            steps_per_revolution: 200,
            revolutions_per_second: 1.0,
            pulley_diameter_mm: None,
            dir_line: 17,
            step_line: 27,
            enable_line: 22,
            pulse_width_us: 1000,
            direction: Direction::Backward,
        }
    }

    /// Z-axis stepper of the bench, belt driven through a 10 mm pulley.
    pub fn z_axis() -> Self {
        Self {
            info: "Stepper motor for the sensor Z motion".to_string(),
            step_angle_deg: 1.8,
            gear_ratio: None,
            steps_per_revolution: 200,
            revolutions_per_second: 0.5,
            pulley_diameter_mm: Some(10.0),
            dir_line: 10,
            step_line: 9,
            enable_line: 11,
            pulse_width_us: 20,
            direction: Direction::Backward,
        }
    }

    pub fn pulse_width(&self) -> Duration {
        Duration::from_micros(self.pulse_width_us)
    }

    /// Period between two step pulses.
    ///
    /// Linear axes moving at `velocity_mm_s` turn at `N = 2·v / (π·D)`
    /// revolutions per second; otherwise the profile's fixed revolution rate
    /// is used. The period is `1 / (N · steps_per_revolution)`.
    pub fn pulse_period(&self, velocity_mm_s: Option<f64>) -> Duration {
        let revolutions_per_second = match (velocity_mm_s, self.pulley_diameter_mm) {
            (Some(v), Some(d)) => 2.0 * v / (PI * d),
            _ => self.revolutions_per_second,
        };
        Duration::from_secs_f64(1.0 / (revolutions_per_second * self.steps_per_revolution as f64))
    }

    /// Number of pulses for a linear move of `|distance_mm|`.
    pub fn pulses_for_distance(&self, distance_mm: f64) -> BenchResult<u32> {
        let diameter = self.pulley_diameter_mm.ok_or_else(|| {
            BenchError::Configuration(format!("'{}' has no pulley diameter", self.info))
        })?;
        let pulses = 2.0 * 180.0 * distance_mm.abs() / (self.step_angle_deg * PI * diameter);
        Ok(pulses.round() as u32)
    }

    /// Number of pulses to turn the output shaft by `angle_deg`.
    pub fn pulses_for_rotation(&self, angle_deg: f64) -> u32 {
        let ratio = self.gear_ratio.unwrap_or(1.0);
        (angle_deg.abs() * ratio / self.step_angle_deg).round() as u32
    }
}

/// Pulse generator bound to one driver's lines.
pub struct StepperDriver {
    profile: MotorProfile,
    lines: MotorLines,
    clock: Arc<dyn Clock>,
    torque_enabled: bool,
}

impl StepperDriver {
    pub fn new(profile: MotorProfile, lines: MotorLines, clock: Arc<dyn Clock>) -> Self {
        Self {
            profile,
            lines,
            clock,
            torque_enabled: false,
        }
    }

    pub fn profile(&self) -> &MotorProfile {
        &self.profile
    }

    pub fn is_torque_enabled(&self) -> bool {
        self.torque_enabled
    }

    pub fn set_direction(&mut self, direction: Direction) -> BenchResult<()> {
        self.lines.direction.set_level(direction.line_level())
    }

    /// Engage the holding torque (enable line low).
    pub fn enable_torque(&mut self) -> BenchResult<()> {
        self.lines.enable.set_low()?;
        self.torque_enabled = true;
        Ok(())
    }

    /// Release the holding torque (enable line high).
    pub fn release_torque(&mut self) -> BenchResult<()> {
        self.lines.enable.set_high()?;
        self.torque_enabled = false;
        Ok(())
    }

    /// Emit a single step pulse and spin until `period` has elapsed since its
    /// rising edge.
    pub fn step_once(&mut self, period: Duration) -> BenchResult<()> {
        let start = self.clock.now();
        self.lines.step.set_high()?;
        self.clock.delay(self.profile.pulse_width());
        self.lines.step.set_low()?;
        self.clock.spin_until(start + period);
        Ok(())
    }

    /// Emit `count` pulses in `direction`.
    ///
    /// `velocity_mm_s` only matters for linear axes. Torque stays engaged
    /// afterwards only when `hold_torque` is set. A zero count touches no line.
    pub fn pulse(
        &mut self,
        direction: Direction,
        count: u32,
        velocity_mm_s: Option<f64>,
        hold_torque: bool,
    ) -> BenchResult<()> {
        if count == 0 {
            return Ok(());
        }

        let period = self.profile.pulse_period(velocity_mm_s);
        trace!(
            "{}: {} pulses {:?}, period {:?}",
            self.profile.info,
            count,
            direction,
            period
        );

        self.set_direction(direction)?;
        self.enable_torque()?;
        self.lines.step.set_low()?;
        for _ in 0..count {
            self.step_once(period)?;
        }

        if !hold_torque {
            self.release_torque()?;
        }
        Ok(())
    }

    /// Move a linear axis by a signed distance.
    ///
    /// Positive distances drive the direction line high. Returns the number of
    /// pulses emitted.
    pub fn move_linear(
        &mut self,
        distance_mm: f64,
        velocity_mm_s: f64,
        hold_torque: bool,
    ) -> BenchResult<u32> {
        if distance_mm == 0.0 {
            return Ok(0);
        }
        let direction = if distance_mm > 0.0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        let count = self.profile.pulses_for_distance(distance_mm)?;
        debug!(
            "{}: moving {} mm ({} pulses)",
            self.profile.info, distance_mm, count
        );
        self.pulse(direction, count, Some(velocity_mm_s), hold_torque)?;
        Ok(count)
    }

    /// Turn a rotary axis by `angle_deg` in the profile's direction.
    pub fn rotate(&mut self, angle_deg: f64, hold_torque: bool) -> BenchResult<u32> {
        let count = self.profile.pulses_for_rotation(angle_deg);
        self.pulse(self.profile.direction, count, None, hold_torque)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotor;
    use crate::timing::FakeClock;

    fn driver(profile: MotorProfile) -> (StepperDriver, MockMotor, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let motor = MockMotor::new();
        let driver = StepperDriver::new(profile, motor.lines(), clock.clone());
        (driver, motor, clock)
    }

    #[test]
    fn test_linear_pulse_count() {
        let profile = MotorProfile::z_axis();
        for distance in [1.0, 12.5, 30.0, 130.0] {
            let expected = (2.0 * 180.0 * distance / (1.8 * PI * 10.0)).round() as u32;
            assert_eq!(profile.pulses_for_distance(distance).unwrap(), expected);
        }
        assert_eq!(profile.pulses_for_distance(30.0).unwrap(), 191);
        assert_eq!(profile.pulses_for_distance(0.0).unwrap(), 0);
    }

    #[test]
    fn test_rotary_pulse_count() {
        let profile = MotorProfile::shaft();
        assert_eq!(profile.pulses_for_rotation(120.0), 400);
        assert_eq!(profile.pulses_for_rotation(4.8), 16);
        assert_eq!(profile.pulses_for_rotation(1.2), 4);
    }

    #[test]
    fn test_linear_needs_pulley() {
        let profile = MotorProfile::shaft();
        assert!(matches!(
            profile.pulses_for_distance(10.0),
            Err(BenchError::Configuration(_))
        ));
    }

    #[test]
    fn test_pulse_periods() {
        let shaft = MotorProfile::shaft();
        assert_eq!(shaft.pulse_period(None), Duration::from_millis(5));

        let z = MotorProfile::z_axis();
        let expected = 1.0 / (2.0 * 15.0 / (PI * 10.0) * 200.0);
        let period = z.pulse_period(Some(15.0)).as_secs_f64();
        assert!((period - expected).abs() < 1e-9);
        // Without a velocity the linear axis falls back to its revolution rate
        assert_eq!(z.pulse_period(None), Duration::from_millis(10));
    }

    #[test]
    fn test_positive_distance_sets_forward_line() {
        let (mut driver, motor, _clock) = driver(MotorProfile::z_axis());
        let pulses = driver.move_linear(30.0, 15.0, false).unwrap();
        assert_eq!(pulses, 191);
        assert_eq!(motor.step.rising_edges(), 191);
        assert!(motor.direction.is_high());
        // Released after the move
        assert!(motor.enable.is_high());
        assert!(!driver.is_torque_enabled());
    }

    #[test]
    fn test_negative_distance_sets_backward_line() {
        let (mut driver, motor, _clock) = driver(MotorProfile::z_axis());
        motor.direction.force(true);
        let pulses = driver.move_linear(-30.0, 15.0, true).unwrap();
        assert_eq!(pulses, 191);
        assert_eq!(motor.step.rising_edges(), 191);
        assert!(!motor.direction.is_high());
        assert!(!motor.enable.is_high());
        assert!(driver.is_torque_enabled());
    }

    #[test]
    fn test_zero_distance_is_noop() {
        let (mut driver, motor, clock) = driver(MotorProfile::z_axis());
        assert_eq!(driver.move_linear(0.0, 15.0, false).unwrap(), 0);
        driver.pulse(Direction::Forward, 0, None, false).unwrap();
        assert_eq!(motor.step.rising_edges(), 0);
        assert_eq!(motor.enable.transitions(), 0);
        assert_eq!(motor.direction.transitions(), 0);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_pulse_train_takes_count_periods() {
        let (mut driver, motor, clock) = driver(MotorProfile::shaft());
        let pulses = driver.rotate(4.8, true).unwrap();
        assert_eq!(pulses, 16);
        assert_eq!(motor.step.rising_edges(), 16);
        assert!(!motor.step.is_high());
        assert_eq!(clock.now(), Duration::from_millis(5) * 16);
    }

    #[test]
    fn test_pulse_width_longer_than_period_stretches_train() {
        let mut profile = MotorProfile::shaft();
        profile.pulse_width_us = 8000;
        let (mut driver, _motor, clock) = driver(profile);
        driver.pulse(Direction::Forward, 2, None, false).unwrap();
        assert_eq!(clock.now(), Duration::from_millis(16));
    }
}
