//! Bench configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults describing the reference bench
//! 2. A TOML file (`config/rotor_bench.toml` by default)
//! 3. Environment variables prefixed with `ROTOR_BENCH_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! ROTOR_BENCH_APPLICATION__LOG_LEVEL=debug
//! ROTOR_BENCH_SENSOR__GAIN=2
//! ROTOR_BENCH_Z_AXIS__HOMING_TIMEOUT_S=60
//! ```

use crate::error::{BenchError, BenchResult};
use crate::error_recovery::RetryPolicy;
use crate::hardware::{MotorProfile, ZAxisSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/rotor_bench.toml";

/// Gains accepted by the magnetometer's `PG` command.
pub const VALID_GAINS: [u32; 4] = [1, 2, 4, 8];

/// Top-level bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default = "MotorProfile::shaft")]
    pub shaft: MotorProfile,
    #[serde(default)]
    pub z_axis: ZAxisConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            gpio: GpioConfig::default(),
            shaft: MotorProfile::shaft(),
            z_axis: ZAxisConfig::default(),
            sensor: SensorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// GPIO character device wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioConfig {
    /// Character device of the GPIO chip
    pub chip: String,
    /// Line offset of the Z limit switch
    pub limit_switch_line: u32,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip4".to_string(),
            limit_switch_line: 8,
        }
    }
}

/// Z axis motor and motion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZAxisConfig {
    pub motor: MotorProfile,
    /// Velocity while seeking the limit switch, mm/s
    #[serde(default = "default_reference_velocity")]
    pub reference_velocity_mm_s: f64,
    /// Velocity of ordinary moves, mm/s
    #[serde(default = "default_move_velocity")]
    pub move_velocity_mm_s: f64,
    /// Re-home every this many angular steps of a by-Z sweep
    #[serde(default = "default_rehome_every")]
    pub rehome_every_rot_steps: u32,
    /// Abort homing after this many seconds (unset waits forever)
    #[serde(default)]
    pub homing_timeout_s: Option<f64>,
}

impl Default for ZAxisConfig {
    fn default() -> Self {
        Self {
            motor: MotorProfile::z_axis(),
            reference_velocity_mm_s: default_reference_velocity(),
            move_velocity_mm_s: default_move_velocity(),
            rehome_every_rot_steps: default_rehome_every(),
            homing_timeout_s: None,
        }
    }
}

/// Magnetometer link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Serial ports tried in order
    pub candidates: Vec<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Serial read/write timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
    /// Samples averaged by the sensor per reading (`NS`)
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,
    /// Programmable gain (`PG`)
    #[serde(default = "default_gain")]
    pub gain: u32,
    /// Wait between `RM` and reading the reply, seconds
    #[serde(default = "default_read_delay")]
    pub read_delay_s: f64,
    /// Conversion from the sensor unit (Oe) to mT
    #[serde(default = "default_oe_to_mt")]
    pub oe_to_mt: f64,
    /// Wait for the power-up banner after opening the port, seconds
    #[serde(default = "default_banner_settle")]
    pub banner_settle_s: f64,
    /// Wait after `NS`/`PG`, seconds
    #[serde(default = "default_command_settle")]
    pub command_settle_s: f64,
    /// Wait after `HI` and `PC` before draining, seconds
    #[serde(default = "default_flush_settle")]
    pub flush_settle_s: f64,
    /// Retries for malformed sample replies
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()],
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout(),
            sample_count: default_sample_count(),
            gain: default_gain(),
            read_delay_s: default_read_delay(),
            oe_to_mt: default_oe_to_mt(),
            banner_settle_s: default_banner_settle(),
            command_settle_s: default_command_settle(),
            flush_settle_s: default_flush_settle(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Output file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving the measurement files
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("TXT"),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_reference_velocity() -> f64 {
    5.0
}

fn default_move_velocity() -> f64 {
    15.0
}

fn default_rehome_every() -> u32 {
    10
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_sample_count() -> u32 {
    10
}

fn default_gain() -> u32 {
    1
}

fn default_read_delay() -> f64 {
    0.7
}

fn default_oe_to_mt() -> f64 {
    0.1
}

fn default_banner_settle() -> f64 {
    3.0
}

fn default_command_settle() -> f64 {
    0.5
}

fn default_flush_settle() -> f64 {
    1.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl BenchConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> BenchResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: the defaults and environment still
    /// apply. After loading, the configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ROTOR_BENCH_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks the log level, the motor mechanics and velocities, the sensor
    /// settings and the Z re-homing cadence.
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        validate_motor("shaft", &self.shaft)?;
        validate_motor("z_axis.motor", &self.z_axis.motor)?;

        match self.z_axis.motor.pulley_diameter_mm {
            Some(d) if d > 0.0 && d.is_finite() => {}
            _ => {
                return Err(BenchError::Configuration(
                    "z_axis.motor.pulley_diameter_mm must be set and positive".to_string(),
                ))
            }
        }

        for (name, value) in [
            ("z_axis.reference_velocity_mm_s", self.z_axis.reference_velocity_mm_s),
            ("z_axis.move_velocity_mm_s", self.z_axis.move_velocity_mm_s),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(BenchError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if self.z_axis.rehome_every_rot_steps == 0 {
            return Err(BenchError::Configuration(
                "z_axis.rehome_every_rot_steps must be at least 1".to_string(),
            ));
        }

        if let Some(timeout) = self.z_axis.homing_timeout_s {
            if !(timeout > 0.0 && timeout.is_finite()) {
                return Err(BenchError::Configuration(format!(
                    "z_axis.homing_timeout_s must be positive, got {}",
                    timeout
                )));
            }
        }

        self.sensor.validate()
    }

    /// Motion settings of the Z axis in the form the axis expects.
    pub fn z_axis_settings(&self) -> ZAxisSettings {
        ZAxisSettings {
            reference_velocity_mm_s: self.z_axis.reference_velocity_mm_s,
            move_velocity_mm_s: self.z_axis.move_velocity_mm_s,
            homing_timeout: self.z_axis.homing_timeout_s.map(Duration::from_secs_f64),
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> BenchResult<()> {
        if self.candidates.is_empty() {
            return Err(BenchError::Configuration(
                "sensor.candidates must list at least one serial port".to_string(),
            ));
        }
        if self.sample_count == 0 {
            return Err(BenchError::Configuration(
                "sensor.sample_count must be at least 1".to_string(),
            ));
        }
        if !VALID_GAINS.contains(&self.gain) {
            return Err(BenchError::Configuration(format!(
                "Invalid sensor.gain {}. Must be one of: {:?}",
                self.gain, VALID_GAINS
            )));
        }
        if !(self.read_delay_s > 0.0 && self.read_delay_s.is_finite()) {
            return Err(BenchError::Configuration(format!(
                "sensor.read_delay_s must be positive, got {}",
                self.read_delay_s
            )));
        }
        if !(self.oe_to_mt > 0.0 && self.oe_to_mt.is_finite()) {
            return Err(BenchError::Configuration(format!(
                "sensor.oe_to_mt must be positive, got {}",
                self.oe_to_mt
            )));
        }
        for (name, value) in [
            ("sensor.banner_settle_s", self.banner_settle_s),
            ("sensor.command_settle_s", self.command_settle_s),
            ("sensor.flush_settle_s", self.flush_settle_s),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(BenchError::Configuration(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

fn validate_motor(name: &str, profile: &MotorProfile) -> BenchResult<()> {
    if !(profile.step_angle_deg > 0.0 && profile.step_angle_deg.is_finite()) {
        return Err(BenchError::Configuration(format!(
            "{}.step_angle_deg must be positive, got {}",
            name, profile.step_angle_deg
        )));
    }
    if profile.steps_per_revolution == 0 {
        return Err(BenchError::Configuration(format!(
            "{}.steps_per_revolution must be at least 1",
            name
        )));
    }
    if !(profile.revolutions_per_second > 0.0 && profile.revolutions_per_second.is_finite()) {
        return Err(BenchError::Configuration(format!(
            "{}.revolutions_per_second must be positive, got {}",
            name, profile.revolutions_per_second
        )));
    }
    if let Some(ratio) = profile.gear_ratio {
        if !(ratio > 0.0 && ratio.is_finite()) {
            return Err(BenchError::Configuration(format!(
                "{}.gear_ratio must be positive, got {}",
                name, ratio
            )));
        }
    }
    Ok(())
}
