//! Scan requests as written by the launcher.
//!
//! The launcher drops a key/value blob on disk. Both the current snake_case
//! keys and the launcher's legacy upper-case keys are accepted, in JSON, in
//! the single-quoted dict notation older launchers write, or in TOML.

use crate::config::VALID_GAINS;
use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Full rotation per Z position.
    ByAngle,
    /// All Z positions per angle step.
    #[serde(alias = "RunBench")]
    ByZPos,
    /// Timed sampling without motion.
    #[serde(alias = "FreeRun", alias = "RunFree")]
    Free,
    /// Release both motors and exit.
    ReleaseMotors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(alias = "MODE")]
    pub mode: ScanMode,
    /// Informational radial offset of the sensor, mm
    #[serde(alias = "WORK_DIST", default)]
    pub working_distance_mm: f64,
    #[serde(alias = "ROT_STEP_DEG", default)]
    pub rotation_step_deg: f64,
    #[serde(alias = "Z_POS_MM", default)]
    pub z_positions_mm: Vec<f64>,
    #[serde(alias = "NB_REPET", default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Free mode: total sampling time, s
    #[serde(alias = "DURATION", default)]
    pub duration_s: Option<f64>,
    /// Free mode: time between two samples, s
    #[serde(alias = "SAMPLING", default)]
    pub sampling_interval_s: Option<f64>,
    /// Free mode sensor overrides
    #[serde(alias = "SENSOR_NB_SAMPLE", default)]
    pub sample_count: Option<u32>,
    #[serde(alias = "SENSOR_GAIN", default)]
    pub gain: Option<u32>,
    #[serde(alias = "SENSOR_READ_DELAY", default)]
    pub read_delay_s: Option<f64>,
}

fn default_repeat_count() -> u32 {
    1
}

impl Default for ScanRequest {
    /// The launcher's fallback when no request file exists.
    fn default() -> Self {
        Self {
            mode: ScanMode::ByZPos,
            working_distance_mm: 12.0,
            rotation_step_deg: 4.8,
            z_positions_mm: vec![0.0, 30.0, 60.0, 90.0],
            repeat_count: 1,
            duration_s: None,
            sampling_interval_s: None,
            sample_count: None,
            gain: None,
            read_delay_s: None,
        }
    }
}

impl ScanRequest {
    /// Parse a request blob.
    pub fn parse(text: &str) -> BenchResult<Self> {
        let json_err = match serde_json::from_str::<Self>(text) {
            Ok(request) => return Ok(request),
            Err(e) => e,
        };
        if let Ok(request) = serde_json::from_str::<Self>(&text.replace('\'', "\"")) {
            return Ok(request);
        }
        toml::from_str::<Self>(text).map_err(|toml_err| {
            BenchError::InvalidRequest(format!(
                "neither JSON ({}) nor TOML ({})",
                json_err,
                toml_err.message()
            ))
        })
    }

    pub fn load(path: &Path) -> BenchResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Reject requests the bench cannot execute.
    ///
    /// A step angle that does not divide 360° and an unordered Z list are
    /// accepted: the last partial step is dropped and Z positions are visited
    /// as listed.
    pub fn validate(&self) -> BenchResult<()> {
        if self.repeat_count == 0 {
            return Err(BenchError::InvalidRequest(
                "repeat_count must be at least 1".to_string(),
            ));
        }

        match self.mode {
            ScanMode::ByAngle | ScanMode::ByZPos => {
                if !(self.rotation_step_deg > 0.0 && self.rotation_step_deg.is_finite()) {
                    return Err(BenchError::InvalidRequest(format!(
                        "rotation_step_deg must be positive, got {}",
                        self.rotation_step_deg
                    )));
                }
                if self.z_positions_mm.is_empty() {
                    return Err(BenchError::InvalidRequest(
                        "z_positions_mm must list at least one position".to_string(),
                    ));
                }
                if let Some(z) = self.z_positions_mm.iter().find(|z| !z.is_finite()) {
                    return Err(BenchError::InvalidRequest(format!(
                        "invalid Z position {}",
                        z
                    )));
                }
            }
            ScanMode::Free => {
                for (name, value) in [
                    ("duration_s", self.duration_s),
                    ("sampling_interval_s", self.sampling_interval_s),
                ] {
                    match value {
                        Some(v) if v > 0.0 && v.is_finite() => {}
                        _ => {
                            return Err(BenchError::InvalidRequest(format!(
                                "{} must be set and positive in Free mode",
                                name
                            )))
                        }
                    }
                }
                if self.sample_count == Some(0) {
                    return Err(BenchError::InvalidRequest(
                        "sample_count must be at least 1".to_string(),
                    ));
                }
                if let Some(gain) = self.gain {
                    if !VALID_GAINS.contains(&gain) {
                        return Err(BenchError::InvalidRequest(format!(
                            "gain must be one of {:?}, got {}",
                            VALID_GAINS, gain
                        )));
                    }
                }
                if let Some(delay) = self.read_delay_s {
                    if !(delay > 0.0 && delay.is_finite()) {
                        return Err(BenchError::InvalidRequest(format!(
                            "read_delay_s must be positive, got {}",
                            delay
                        )));
                    }
                }
            }
            ScanMode::ReleaseMotors => {}
        }
        Ok(())
    }
}
