//! Mock Hardware Implementations
//!
//! Provides simulated GPIO lines for testing the motion layer without a bench.
//! Mocks are cheap to clone: every clone shares the same line state, so a test
//! keeps one handle for inspection and hands the other to the driver.
//!
//! # Available Mocks
//!
//! - `MockOutputLine` - Output pin recording its level, transitions and rising edges
//! - `MockLimitSwitch` - Input pin that reads pressed after a number of polls
//! - `MockMotor` - The three lines of one stepper driver

use crate::hardware::gpio::MotorLines;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

// =============================================================================
// MockOutputLine - Simulated Output Pin
// =============================================================================

#[derive(Debug, Default)]
struct LineState {
    level: bool,
    transitions: u64,
    rising_edges: u64,
}

/// Mock output pin.
///
/// # Example
///
/// ```rust,ignore
/// let step = MockOutputLine::new(false);
/// let mut driver_side = step.clone();
/// driver_side.set_high()?;
/// assert_eq!(step.rising_edges(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockOutputLine {
    state: Arc<Mutex<LineState>>,
}

impl MockOutputLine {
    pub fn new(initial: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(LineState {
                level: initial,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        // A poisoned mock only means another test thread panicked mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_high(&self) -> bool {
        self.lock().level
    }

    /// Number of level changes since creation.
    pub fn transitions(&self) -> u64 {
        self.lock().transitions
    }

    /// Number of low-to-high changes since creation.
    pub fn rising_edges(&self) -> u64 {
        self.lock().rising_edges
    }

    /// Set the level without recording a transition.
    pub fn force(&self, level: bool) {
        self.lock().level = level;
    }

    fn drive(&self, level: bool) {
        let mut state = self.lock();
        if state.level != level {
            state.transitions += 1;
            if level {
                state.rising_edges += 1;
            }
        }
        state.level = level;
    }
}

impl ErrorType for MockOutputLine {
    type Error = Infallible;
}

impl OutputPin for MockOutputLine {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}

// =============================================================================
// MockLimitSwitch - Simulated Limit Switch
// =============================================================================

#[derive(Debug)]
struct SwitchState {
    polls: u64,
    pressed_after: Option<u64>,
}

/// Mock limit switch.
///
/// Reads released for the first `n` polls and pressed from then on. A switch
/// built with [`MockLimitSwitch::never_pressed`] models a disconnected switch.
#[derive(Debug, Clone)]
pub struct MockLimitSwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl MockLimitSwitch {
    pub fn pressed_after(polls: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SwitchState {
                polls: 0,
                pressed_after: Some(polls),
            })),
        }
    }

    /// Switch already pressed on the first poll.
    pub fn pressed() -> Self {
        Self::pressed_after(0)
    }

    pub fn never_pressed() -> Self {
        Self {
            state: Arc::new(Mutex::new(SwitchState {
                polls: 0,
                pressed_after: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn polls(&self) -> u64 {
        self.lock().polls
    }
}

impl ErrorType for MockLimitSwitch {
    type Error = Infallible;
}

impl InputPin for MockLimitSwitch {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        let mut state = self.lock();
        let pressed = state
            .pressed_after
            .map_or(false, |threshold| state.polls >= threshold);
        state.polls += 1;
        Ok(pressed)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.is_high().map(|high| !high)
    }
}

// =============================================================================
// MockMotor - Simulated Stepper Driver Lines
// =============================================================================

/// The direction, step and enable lines of one mock driver.
///
/// Lines start as the bench initialises them: direction and step low, enable
/// high (torque released).
#[derive(Debug, Clone)]
pub struct MockMotor {
    pub direction: MockOutputLine,
    pub step: MockOutputLine,
    pub enable: MockOutputLine,
}

impl MockMotor {
    pub fn new() -> Self {
        Self {
            direction: MockOutputLine::new(false),
            step: MockOutputLine::new(false),
            enable: MockOutputLine::new(true),
        }
    }

    /// Boxed clones of the lines for a driver.
    pub fn lines(&self) -> MotorLines {
        MotorLines {
            direction: Box::new(self.direction.clone()),
            step: Box::new(self.step.clone()),
            enable: Box::new(self.enable.clone()),
        }
    }

    pub fn torque_engaged(&self) -> bool {
        !self.enable.is_high()
    }
}

impl Default for MockMotor {
    fn default() -> Self {
        Self::new()
    }
}
