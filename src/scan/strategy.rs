//! Traversal order of the (angle × Z) grid.
//!
//! These helpers are pure so the sequencing can be checked without a bench.

use crate::data::RecordLayout;
use crate::scan::ScanMode;

/// Nesting order of a grid scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Z is the slow axis: full rotation at each Z position.
    ByAngle,
    /// Angle is the slow axis: all Z positions at each angle step.
    ByZPos,
}

impl ScanStrategy {
    /// The strategy of a grid mode, `None` for the others.
    pub fn for_mode(mode: ScanMode) -> Option<Self> {
        match mode {
            ScanMode::ByAngle => Some(ScanStrategy::ByAngle),
            ScanMode::ByZPos => Some(ScanStrategy::ByZPos),
            ScanMode::Free | ScanMode::ReleaseMotors => None,
        }
    }

    pub fn layout(self) -> RecordLayout {
        match self {
            ScanStrategy::ByAngle => RecordLayout::ByAngle,
            ScanStrategy::ByZPos => RecordLayout::ByZPos,
        }
    }
}

/// `(index, angle)` for every step of one rotation, while `index · step < 360`.
pub fn angle_steps(rotation_step_deg: f64) -> impl Iterator<Item = (u32, f64)> {
    let usable = rotation_step_deg > 0.0 && rotation_step_deg.is_finite();
    (0u32..)
        .map(move |index| (index, f64::from(index) * rotation_step_deg))
        .take_while(move |(_, angle)| usable && *angle < 360.0)
}

/// Z position indices visited at `angle_index`: ascending on even steps,
/// descending on odd ones.
pub fn z_traversal(angle_index: u32, z_count: usize) -> Vec<usize> {
    if angle_index % 2 == 0 {
        (0..z_count).collect()
    } else {
        (0..z_count).rev().collect()
    }
}

/// Whether Z must be homed before angle step `angle_index`.
pub fn rehome_due(angle_index: u32, every: u32) -> bool {
    angle_index % every.max(1) == 0
}
