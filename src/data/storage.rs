//! Plain-text measurement files.
//!
//! One file per repetition. A file starts with `#` comment lines (the sensor
//! calibration, the sensor settings, the scan geometry and a column header)
//! followed by `;`-separated data lines. Every line is flushed as soon as it is
//! written so a file stays usable up to the last sample if the scan dies.

use crate::error::BenchResult;
use crate::instrument::FieldVector;
use chrono::{DateTime, TimeZone};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Line grammar of a measurement file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// One line per angle with a triple per Z position.
    ByZPos,
    /// One line per (Z position, angle).
    ByAngle,
    /// One line per timed sample.
    Free,
}

impl RecordLayout {
    pub fn name(self) -> &'static str {
        match self {
            RecordLayout::ByZPos => "ByZPos",
            RecordLayout::ByAngle => "ByAngle",
            RecordLayout::Free => "Free",
        }
    }

    fn column_header(self, z_count: usize) -> String {
        match self {
            RecordLayout::ByZPos => {
                let mut line = "# angle[°]".to_string();
                for n in 1..=z_count {
                    line.push_str(&format!(
                        "; X{n}_magn [mT]; Y{n}_magn [mT]; Z{n}_magn [mT]"
                    ));
                }
                line
            }
            RecordLayout::ByAngle => {
                "# ZPos#; a[°]; X1_magn[mT]; Y1_magn[mT]; Z1_magn[mT]".to_string()
            }
            RecordLayout::Free => "# Time[s]; Xmagn [mT]; Ymagn [mT]; Zmagn [mT];".to_string(),
        }
    }
}

/// Sensor settings recorded in every header.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorParameters {
    pub sample_count: u32,
    pub gain: u32,
    pub read_delay_s: f64,
    pub oe_to_mt: f64,
}

/// Scan geometry recorded in grid headers.
#[derive(Debug, Clone, PartialEq)]
pub struct GridParameters {
    pub working_distance_mm: f64,
    pub rotation_step_deg: f64,
    pub z_positions_mm: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub layout: RecordLayout,
    /// Calibration text, already comment-prefixed
    pub calibration: String,
    pub sensor: SensorParameters,
    /// Required for the grid layouts, ignored for [`RecordLayout::Free`]
    pub grid: Option<GridParameters>,
}

impl RecordHeader {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.calibration);
        if !self.calibration.is_empty() && !self.calibration.ends_with('\n') {
            out.push('\n');
        }

        out.push_str(&format!("# SENSOR_NB_SAMPLE: {}\n", self.sensor.sample_count));
        out.push_str(&format!("# SENSOR_GAIN: {}\n", self.sensor.gain));
        out.push_str(&format!("# SENSOR_READ_DELAY: {}\n", self.sensor.read_delay_s));
        out.push_str(&format!("# SENSOR_Oe_mT: {}\n", self.sensor.oe_to_mt));

        let mut z_count = 0;
        if self.layout != RecordLayout::Free {
            if let Some(grid) = &self.grid {
                out.push_str(&format!("# working dist: {} mm\n", grid.working_distance_mm));
                out.push_str(&format!("# Rotation step angle: {}°\n", grid.rotation_step_deg));
                for (n, z) in grid.z_positions_mm.iter().enumerate() {
                    out.push_str(&format!("# sensor pos #{}: {} mm\n", n + 1, z));
                }
                z_count = grid.z_positions_mm.len();
            }
            out.push_str(&format!("# {}\n", self.layout.name()));
        }

        out.push_str(&self.layout.column_header(z_count));
        out.push('\n');
        out
    }
}

// ============================================================================
// File names
// ============================================================================

fn z_token(z_mm: f64) -> String {
    if z_mm.fract() == 0.0 {
        format!("{:03}", z_mm as i64)
    } else {
        format!("{:05.1}", z_mm)
    }
}

/// `ROTOR_<timestamp>_<mode>_WDIST-<wd>_ROTSTEP-<step>_<z>..._<n>of<m>.txt`
pub fn grid_file_name<Tz: TimeZone>(
    started: &DateTime<Tz>,
    layout: RecordLayout,
    grid: &GridParameters,
    repetition: u32,
    repeat_count: u32,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let mut name = format!(
        "ROTOR_{}_{}_WDIST-{}_ROTSTEP-{:.1}",
        started.format(TIMESTAMP_FORMAT),
        layout.name(),
        grid.working_distance_mm,
        grid.rotation_step_deg
    );
    for z in &grid.z_positions_mm {
        name.push('_');
        name.push_str(&z_token(*z));
    }
    name.push_str(&format!("_{}of{}.txt", repetition, repeat_count));
    name
}

/// `FREE_<timestamp>_SMPL-<n>_GAIN-<g>_DELAY-<d>_<n>of<m>.txt`
pub fn free_file_name<Tz: TimeZone>(
    started: &DateTime<Tz>,
    sensor: &SensorParameters,
    repetition: u32,
    repeat_count: u32,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "FREE_{}_SMPL-{:03}_GAIN-{:02}_DELAY-{:04.2}_{}of{}.txt",
        started.format(TIMESTAMP_FORMAT),
        sensor.sample_count,
        sensor.gain,
        sensor.read_delay_s,
        repetition,
        repeat_count
    )
}

// ============================================================================
// Data lines
// ============================================================================

fn push_triple(line: &mut String, field: &FieldVector) {
    line.push_str(&format!(";{:12.6};{:12.6};{:12.6}", field.x, field.y, field.z));
}

/// `angle;X1;Y1;Z1;X2;...` with one triple per Z position.
pub fn by_zpos_line(angle_deg: f64, fields: &[FieldVector]) -> String {
    let mut line = format!("{:5.1}", angle_deg);
    for field in fields {
        push_triple(&mut line, field);
    }
    line
}

/// `zpos_index;angle;X;Y;Z`
pub fn by_angle_line(z_index: usize, angle_deg: f64, field: &FieldVector) -> String {
    let mut line = format!("{:2};{:5.1}", z_index, angle_deg);
    push_triple(&mut line, field);
    line
}

/// `elapsed;X;Y;Z`
pub fn free_line(elapsed_s: f64, field: &FieldVector) -> String {
    let mut line = format!("{:5.2}", elapsed_s);
    push_triple(&mut line, field);
    line
}

// ============================================================================
// Writer
// ============================================================================

/// Append-only writer of one measurement file.
pub struct RecordWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    lines_written: usize,
}

impl RecordWriter {
    /// Create `file_name` under `dir`, creating `dir` if needed.
    ///
    /// An existing file is never touched: a numbered suffix is added to the
    /// stem until the name is free.
    pub fn create(dir: &Path, file_name: &str) -> BenchResult<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }

        let stem = file_name.strip_suffix(".txt").unwrap_or(file_name);
        let mut candidate = dir.join(file_name);
        let mut suffix = 1;
        let file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => break file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    warn!("{} already exists", candidate.display());
                    candidate = dir.join(format!("{}-{}.txt", stem, suffix));
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!("Writing measurements to {}", candidate.display());
        Ok(Self {
            path: candidate,
            writer: BufWriter::new(file),
            lines_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data lines appended so far.
    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    pub fn write_header(&mut self, header: &RecordHeader) -> BenchResult<()> {
        self.writer.write_all(header.render().as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Append one data line and flush it to the file.
    pub fn append_line(&mut self, line: &str) -> BenchResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.lines_written += 1;
        debug!("[DATA] {}", line);
        Ok(())
    }

    /// Write the duration trailer and close the file.
    pub fn close(mut self, duration: Duration) -> BenchResult<PathBuf> {
        writeln!(
            self.writer,
            "# Measurement duration: {:.1} sec",
            duration.as_secs_f64()
        )?;
        self.writer.flush()?;
        info!(
            "Closed {} ({} data lines)",
            self.path.display(),
            self.lines_written
        );
        Ok(self.path)
    }
}
