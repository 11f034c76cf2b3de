//! Digital lines driving the stepper drivers and reading the Z limit switch.
//!
//! Lines are plain `embedded-hal` pins. The object-safe [`OutputLine`] and
//! [`InputLine`] traits are blanket-implemented for any such pin so the bench
//! can hold real character-device lines and mock lines behind the same boxes.

use crate::error::{BenchError, BenchResult};
use embedded_hal::digital::{Error as _, InputPin, OutputPin};

/// A digital output line (direction, step or enable).
pub trait OutputLine: Send {
    fn set_level(&mut self, high: bool) -> BenchResult<()>;

    fn set_high(&mut self) -> BenchResult<()> {
        self.set_level(true)
    }

    fn set_low(&mut self) -> BenchResult<()> {
        self.set_level(false)
    }
}

/// A digital input line.
pub trait InputLine: Send {
    fn is_high(&mut self) -> BenchResult<bool>;
}

impl<T> OutputLine for T
where
    T: OutputPin + Send,
{
    fn set_level(&mut self, high: bool) -> BenchResult<()> {
        let result = if high { OutputPin::set_high(self) } else { OutputPin::set_low(self) };
        result.map_err(|e| BenchError::Gpio(format!("output line fault: {:?}", e.kind())))
    }
}

impl<T> InputLine for T
where
    T: InputPin + Send,
{
    fn is_high(&mut self) -> BenchResult<bool> {
        InputPin::is_high(self)
            .map_err(|e| BenchError::Gpio(format!("input line fault: {:?}", e.kind())))
    }
}

/// The three lines of one stepper driver.
pub struct MotorLines {
    pub direction: Box<dyn OutputLine>,
    pub step: Box<dyn OutputLine>,
    pub enable: Box<dyn OutputLine>,
}

/// Every line the bench needs.
pub struct BenchLines {
    pub shaft: MotorLines,
    pub z_axis: MotorLines,
    pub limit_switch: Box<dyn InputLine>,
}

// ============================================================================
// Linux GPIO character device
// ============================================================================

#[cfg(feature = "gpio_cdev")]
mod cdev_enabled {
    use super::*;
    use crate::config::BenchConfig;
    use crate::hardware::stepper::MotorProfile;
    use linux_embedded_hal::gpio_cdev::{Chip, LineRequestFlags};
    use linux_embedded_hal::CdevPin;
    use tracing::info;

    fn gpio_err<E: std::fmt::Display>(context: String) -> impl FnOnce(E) -> BenchError {
        move |e| BenchError::Gpio(format!("{}: {}", context, e))
    }

    fn request_line(
        chip: &mut Chip,
        offset: u32,
        flags: LineRequestFlags,
        default: u8,
        consumer: &str,
    ) -> BenchResult<CdevPin> {
        let handle = chip
            .get_line(offset)
            .map_err(gpio_err(format!("cannot get line {}", offset)))?
            .request(flags, default, consumer)
            .map_err(gpio_err(format!("cannot request line {} for {}", offset, consumer)))?;
        CdevPin::new(handle).map_err(gpio_err(format!("cannot wrap line {}", offset)))
    }

    fn motor_lines(chip: &mut Chip, profile: &MotorProfile, name: &str) -> BenchResult<MotorLines> {
        // Drivers start released (enable high) with step and direction low
        let direction = request_line(
            chip,
            profile.dir_line,
            LineRequestFlags::OUTPUT,
            0,
            &format!("{}_DIR", name),
        )?;
        let step = request_line(
            chip,
            profile.step_line,
            LineRequestFlags::OUTPUT,
            0,
            &format!("{}_STEP", name),
        )?;
        let enable = request_line(
            chip,
            profile.enable_line,
            LineRequestFlags::OUTPUT,
            1,
            &format!("{}_ENA", name),
        )?;
        Ok(MotorLines {
            direction: Box::new(direction),
            step: Box::new(step),
            enable: Box::new(enable),
        })
    }

    pub fn open_bench_lines(config: &BenchConfig) -> BenchResult<BenchLines> {
        let mut chip = Chip::new(&config.gpio.chip)
            .map_err(gpio_err(format!("cannot open {}", config.gpio.chip)))?;

        let shaft = motor_lines(&mut chip, &config.shaft, "stepper1")?;
        let z_axis = motor_lines(&mut chip, &config.z_axis.motor, "stepper2")?;

        // The switch is wired normally closed to ground and the line reads high
        // once the carriage opens it. No bias is requested: the v1 character
        // device ABI has no bias flags, so this relies on the SoC's power-on
        // pull-up of the line (BCM8 on the bench).
        let limit_switch = request_line(
            &mut chip,
            config.gpio.limit_switch_line,
            LineRequestFlags::INPUT,
            0,
            "limit_switch",
        )?;

        info!("GPIO lines requested on {}", config.gpio.chip);
        Ok(BenchLines {
            shaft,
            z_axis,
            limit_switch: Box::new(limit_switch),
        })
    }
}

#[cfg(not(feature = "gpio_cdev"))]
mod cdev_disabled {
    use super::*;
    use crate::config::BenchConfig;

    pub fn open_bench_lines(_config: &BenchConfig) -> BenchResult<BenchLines> {
        Err(BenchError::FeatureNotEnabled("gpio_cdev".to_string()))
    }
}

#[cfg(feature = "gpio_cdev")]
pub use cdev_enabled::open_bench_lines;

#[cfg(not(feature = "gpio_cdev"))]
pub use cdev_disabled::open_bench_lines;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockLimitSwitch, MockOutputLine};

    #[test]
    fn test_mock_pins_drive_through_line_traits() {
        let pin = MockOutputLine::new(false);
        let mut line: Box<dyn OutputLine> = Box::new(pin.clone());
        line.set_high().unwrap();
        line.set_low().unwrap();
        line.set_high().unwrap();
        assert!(pin.is_high());
        assert_eq!(pin.rising_edges(), 2);
    }

    #[test]
    fn test_limit_switch_through_input_trait() {
        let mut switch: Box<dyn InputLine> = Box::new(MockLimitSwitch::pressed_after(1));
        assert!(!switch.is_high().unwrap());
        assert!(switch.is_high().unwrap());
    }

    #[cfg(not(feature = "gpio_cdev"))]
    #[test]
    fn test_open_lines_without_feature() {
        let config = crate::config::BenchConfig::default();
        assert!(matches!(
            open_bench_lines(&config),
            Err(BenchError::FeatureNotEnabled(_))
        ));
    }
}
