//! Measurement instruments of the bench.
//!
//! The only instrument is the three-axis magnetometer on the Z carriage,
//! driven through [`magnetometer::SensorLink`].

pub mod magnetometer;

pub use magnetometer::{parse_reply, SensorLink, SensorSettings};

/// Magnetic field vector in mT.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl FieldVector {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

/// One reading together with where it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub field: FieldVector,
    /// Shaft angle, degrees (grid modes)
    pub angle_deg: Option<f64>,
    /// Z position, mm (grid modes)
    pub z_position_mm: Option<f64>,
}

impl SensorSample {
    pub fn at(field: FieldVector, angle_deg: f64, z_position_mm: f64) -> Self {
        Self {
            field,
            angle_deg: Some(angle_deg),
            z_position_mm: Some(z_position_mm),
        }
    }

    pub fn unplaced(field: FieldVector) -> Self {
        Self {
            field,
            angle_deg: None,
            z_position_mm: None,
        }
    }
}
