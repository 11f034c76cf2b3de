//! Scan state machine
//!
//! [`ScanOrchestrator`] owns both motors and the sensor link for the whole
//! scan. It sequences homing, Z moves, shaft steps and sensor reads for the
//! requested mode and streams every sample to a [`RecordWriter`].
//!
//! ## Guarantees
//!
//! - Both torques are released and the sensor link is closed when
//!   [`ScanOrchestrator::run`] returns, whether the scan completed, was
//!   stopped or failed.
//! - An emergency stop releases both torques as soon as it is requested, from
//!   whichever thread raised it. The scan itself stops before its next
//!   discrete step (an angle step, a Z move or a sample); homing checks it
//!   before every pulse.
//! - A Z position is only trusted after a home; the first move of each
//!   repetition homes the axis.

use crate::config::BenchConfig;
use crate::data::storage::{by_angle_line, by_zpos_line, free_line};
use crate::data::{
    free_file_name, grid_file_name, GridParameters, RecordHeader, RecordLayout, RecordWriter,
    SensorParameters,
};
use crate::error::{BenchError, BenchResult};
use crate::hardware::{BenchLines, StepperDriver, ZAxis};
use crate::instrument::{FieldVector, SensorLink, SensorSample};
use crate::scan::request::{ScanMode, ScanRequest};
use crate::scan::state::{BenchState, StopHandle};
use crate::scan::strategy::{angle_steps, rehome_due, z_traversal, ScanStrategy};
use crate::timing::Clock;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a scan drives.
pub struct Bench {
    pub shaft: StepperDriver,
    pub z_axis: ZAxis,
    pub sensor: SensorLink,
    /// Emergency stop wired to both enable lines
    pub stop: StopHandle,
}

impl Bench {
    /// Wire the motors of `config` to `lines`. The sensor link is expected
    /// to be open and configured.
    pub fn new(
        config: &BenchConfig,
        mut lines: BenchLines,
        sensor: SensorLink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stop = StopHandle::new();
        lines.shaft.enable = stop.guard_enable(lines.shaft.enable);
        lines.z_axis.enable = stop.guard_enable(lines.z_axis.enable);

        let shaft = StepperDriver::new(config.shaft.clone(), lines.shaft, Arc::clone(&clock));
        let z_motor = StepperDriver::new(
            config.z_axis.motor.clone(),
            lines.z_axis,
            Arc::clone(&clock),
        );
        let z_axis = ZAxis::new(z_motor, lines.limit_switch, clock, config.z_axis_settings());
        Self {
            shaft,
            z_axis,
            sensor,
            stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// Re-home Z every this many angle steps of a by-Z sweep
    pub rehome_every: u32,
    pub output_dir: PathBuf,
    /// Minimum duration of an angle step when only one Z position is scanned
    pub single_plane_cadence: Duration,
}

impl From<&BenchConfig> for ScanSettings {
    fn from(config: &BenchConfig) -> Self {
        Self {
            rehome_every: config.z_axis.rehome_every_rot_steps,
            output_dir: config.storage.output_dir.clone(),
            single_plane_cadence: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// An emergency stop ended the scan early.
    Stopped,
}

/// Summary of a finished scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub outcome: ScanOutcome,
    /// Measurement files, in the order they were written
    pub files: Vec<PathBuf>,
    pub data_lines: usize,
    pub homes: u32,
    pub final_state: BenchState,
}

pub struct ScanOrchestrator {
    bench: Bench,
    settings: ScanSettings,
    clock: Arc<dyn Clock>,
    state: BenchState,
    stop: StopHandle,
}

impl ScanOrchestrator {
    pub fn new(bench: Bench, settings: ScanSettings, clock: Arc<dyn Clock>) -> Self {
        let stop = bench.stop.clone();
        Self {
            bench,
            settings,
            clock,
            state: BenchState::default(),
            stop,
        }
    }

    /// Handle through which another thread can request an emergency stop.
    /// Requesting it releases both torques immediately.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> &BenchState {
        &self.state
    }

    /// Execute `request`, then release the motors and close the sensor link.
    pub fn run(mut self, request: &ScanRequest) -> BenchResult<ScanReport> {
        info!(
            "Starting {:?} scan: {} repetition(s)",
            request.mode, request.repeat_count
        );
        let started = Local::now();
        let mut report = ScanReport {
            mode: request.mode,
            outcome: ScanOutcome::Completed,
            files: Vec::new(),
            data_lines: 0,
            homes: 0,
            final_state: BenchState::default(),
        };

        let result = request
            .validate()
            .and_then(|()| self.execute(request, &started, &mut report));

        let released = self.release_all();
        self.bench.sensor.close();

        report.outcome = result?;
        released?;
        report.homes = self.state.homes_performed;
        report.final_state = self.state.clone();
        info!(
            "End of {:?} scan ({:?}): {} file(s), {} data lines",
            report.mode,
            report.outcome,
            report.files.len(),
            report.data_lines
        );
        Ok(report)
    }

    fn execute(
        &mut self,
        request: &ScanRequest,
        started: &DateTime<Local>,
        report: &mut ScanReport,
    ) -> BenchResult<ScanOutcome> {
        match request.mode {
            ScanMode::ReleaseMotors => {
                self.release_all()?;
                Ok(ScanOutcome::Completed)
            }
            ScanMode::Free => self.run_free(request, started, report),
            ScanMode::ByAngle | ScanMode::ByZPos => {
                let strategy = ScanStrategy::for_mode(request.mode).ok_or_else(|| {
                    BenchError::InvalidRequest(format!("{:?} is not a grid mode", request.mode))
                })?;
                self.run_grid(strategy, request, started, report)
            }
        }
    }

    // ========================================================================
    // Grid scans
    // ========================================================================

    fn run_grid(
        &mut self,
        strategy: ScanStrategy,
        request: &ScanRequest,
        started: &DateTime<Local>,
        report: &mut ScanReport,
    ) -> BenchResult<ScanOutcome> {
        let calibration = self.bench.sensor.calibration_snapshot()?;
        let layout = strategy.layout();
        let grid = GridParameters {
            working_distance_mm: request.working_distance_mm,
            rotation_step_deg: request.rotation_step_deg,
            z_positions_mm: request.z_positions_mm.clone(),
        };

        for repetition in 1..=request.repeat_count {
            if self.stop_requested() {
                return Ok(ScanOutcome::Stopped);
            }
            self.state.reset_for_repetition(repetition);

            let header = RecordHeader {
                layout,
                calibration: calibration.clone(),
                sensor: self.sensor_parameters(),
                grid: Some(grid.clone()),
            };
            let file_name = grid_file_name(started, layout, &grid, repetition, request.repeat_count);

            let outcome = self.record_file(&file_name, &header, report, |this, writer| {
                this.bench.shaft.enable_torque()?;
                let swept = match strategy {
                    ScanStrategy::ByZPos => this.sweep_by_zpos(request, writer),
                    ScanStrategy::ByAngle => this.sweep_by_angle(request, writer),
                };
                let released = this.release_all();
                let outcome = swept?;
                released?;
                Ok(outcome)
            })?;

            if outcome == ScanOutcome::Stopped {
                return Ok(outcome);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    /// Angle is the slow axis: at each angle step visit every Z position,
    /// alternating the direction of the Z sweep.
    fn sweep_by_zpos(
        &mut self,
        request: &ScanRequest,
        writer: &mut RecordWriter,
    ) -> BenchResult<ScanOutcome> {
        let z_positions = &request.z_positions_mm;
        let single_plane = z_positions.len() == 1;

        for (index, angle) in angle_steps(request.rotation_step_deg) {
            if self.stop_requested() {
                return Ok(ScanOutcome::Stopped);
            }
            self.state.angle_index = index;
            let step_start = self.clock.now();

            if rehome_due(index, self.settings.rehome_every) && !self.home_z()? {
                return Ok(ScanOutcome::Stopped);
            }

            let mut fields = vec![FieldVector::default(); z_positions.len()];
            for z_index in z_traversal(index, z_positions.len()) {
                let z = z_positions[z_index];
                if self.stop_requested() || !self.move_z(z)? || self.stop_requested() {
                    return Ok(ScanOutcome::Stopped);
                }
                fields[z_index] = self.measure(angle, z)?.field;
            }
            writer.append_line(&by_zpos_line(angle, &fields))?;

            if self.stop_requested() {
                return Ok(ScanOutcome::Stopped);
            }
            self.bench.shaft.rotate(request.rotation_step_deg, true)?;

            if single_plane {
                self.clock
                    .spin_until(step_start + self.settings.single_plane_cadence);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    /// Z is the slow axis: home once, then a full rotation at each Z position.
    fn sweep_by_angle(
        &mut self,
        request: &ScanRequest,
        writer: &mut RecordWriter,
    ) -> BenchResult<ScanOutcome> {
        if !self.home_z()? {
            return Ok(ScanOutcome::Stopped);
        }

        for (z_index, &z) in request.z_positions_mm.iter().enumerate() {
            if self.stop_requested() || !self.move_z(z)? {
                return Ok(ScanOutcome::Stopped);
            }

            for (index, angle) in angle_steps(request.rotation_step_deg) {
                if self.stop_requested() {
                    return Ok(ScanOutcome::Stopped);
                }
                self.state.angle_index = index;
                let sample = self.measure(angle, z)?;
                writer.append_line(&by_angle_line(z_index, angle, &sample.field))?;
                if self.stop_requested() {
                    return Ok(ScanOutcome::Stopped);
                }
                self.bench.shaft.rotate(request.rotation_step_deg, true)?;
            }
        }
        Ok(ScanOutcome::Completed)
    }

    // ========================================================================
    // Free run
    // ========================================================================

    fn run_free(
        &mut self,
        request: &ScanRequest,
        started: &DateTime<Local>,
        report: &mut ScanReport,
    ) -> BenchResult<ScanOutcome> {
        self.release_all()?;

        let duration = Duration::from_secs_f64(required(request.duration_s, "duration_s")?);
        let interval = Duration::from_secs_f64(required(
            request.sampling_interval_s,
            "sampling_interval_s",
        )?);

        let current = self.bench.sensor.settings().clone();
        let sample_count = request.sample_count.unwrap_or(current.sample_count);
        let gain = request.gain.unwrap_or(current.gain);
        if sample_count != current.sample_count || gain != current.gain {
            self.bench.sensor.configure(sample_count, gain)?;
        }
        if let Some(delay) = request.read_delay_s {
            self.bench.sensor.set_read_delay(Duration::from_secs_f64(delay));
        }

        let calibration = self.bench.sensor.calibration_snapshot()?;
        let sensor = self.sensor_parameters();

        for repetition in 1..=request.repeat_count {
            if self.stop_requested() {
                return Ok(ScanOutcome::Stopped);
            }
            self.state.reset_for_repetition(repetition);

            let header = RecordHeader {
                layout: RecordLayout::Free,
                calibration: calibration.clone(),
                sensor: sensor.clone(),
                grid: None,
            };
            let file_name = free_file_name(started, &sensor, repetition, request.repeat_count);

            let outcome = self.record_file(&file_name, &header, report, |this, writer| {
                let t0 = this.clock.now();
                loop {
                    if this.stop_requested() {
                        return Ok(ScanOutcome::Stopped);
                    }
                    let sample_start = this.clock.now();
                    let field = this.bench.sensor.read_vector()?;
                    let elapsed = this.clock.now() - t0;
                    writer.append_line(&free_line(elapsed.as_secs_f64(), &field))?;

                    this.clock.spin_until(sample_start + interval);
                    if this.clock.now() - t0 >= duration {
                        return Ok(ScanOutcome::Completed);
                    }
                }
            })?;

            if outcome == ScanOutcome::Stopped {
                return Ok(outcome);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    /// Open a measurement file, flush the sensor, run `body`, then close the
    /// file even if `body` failed.
    fn record_file<F>(
        &mut self,
        file_name: &str,
        header: &RecordHeader,
        report: &mut ScanReport,
        body: F,
    ) -> BenchResult<ScanOutcome>
    where
        F: FnOnce(&mut Self, &mut RecordWriter) -> BenchResult<ScanOutcome>,
    {
        let mut writer = RecordWriter::create(&self.settings.output_dir, file_name)?;
        writer.write_header(header)?;
        self.bench.sensor.flush_input()?;

        let opened = self.clock.now();
        let outcome = body(self, &mut writer);

        report.data_lines += writer.lines_written();
        let path = writer.close(self.clock.now() - opened)?;
        report.files.push(path);
        outcome
    }

    /// Home Z. Returns false when an emergency stop aborted the homing.
    fn home_z(&mut self) -> BenchResult<bool> {
        let stop = self.stop.clone();
        match self.bench.z_axis.home(true, &|| stop.is_requested())? {
            Some(z) => {
                self.state.z_position_mm = Some(z);
                self.state.homes_performed += 1;
                Ok(true)
            }
            None => {
                self.state.z_position_mm = None;
                self.stop_requested();
                Ok(false)
            }
        }
    }

    /// Move Z to `target_mm`, homing first if the position is unknown.
    /// Returns false when an emergency stop aborted that homing.
    fn move_z(&mut self, target_mm: f64) -> BenchResult<bool> {
        if self.state.z_position_mm.is_none() && !self.home_z()? {
            return Ok(false);
        }
        let current = self.state.z_position_mm.unwrap_or(0.0);
        let reached = self.bench.z_axis.move_to(current, target_mm, true)?;
        self.state.z_position_mm = Some(reached);
        Ok(true)
    }

    fn measure(&mut self, angle_deg: f64, z_mm: f64) -> BenchResult<SensorSample> {
        let field = self.bench.sensor.read_vector()?;
        debug!("angle {} deg, z {} mm: {:?}", angle_deg, z_mm, field);
        Ok(SensorSample::at(field, angle_deg, z_mm))
    }

    fn sensor_parameters(&self) -> SensorParameters {
        let settings = self.bench.sensor.settings();
        SensorParameters {
            sample_count: settings.sample_count,
            gain: settings.gain,
            read_delay_s: settings.read_delay.as_secs_f64(),
            oe_to_mt: settings.oe_to_mt,
        }
    }

    /// Whether an emergency stop is pending. The first time one is seen, both
    /// torques are released.
    fn stop_requested(&mut self) -> bool {
        if self.stop.is_requested() && !self.state.emergency_stop_required {
            warn!("Emergency stop requested");
            self.state.emergency_stop_required = true;
            if let Err(e) = self.release_all() {
                warn!("Failed to release motors on emergency stop: {}", e);
            }
        }
        self.state.emergency_stop_required
    }

    /// Raise the emergency stop from the scan thread.
    pub fn emergency_stop(&mut self) -> BenchResult<()> {
        self.stop.request();
        self.state.emergency_stop_required = true;
        warn!("Emergency stop");
        self.release_all()
    }

    /// Release the torque of both motors.
    pub fn release_all(&mut self) -> BenchResult<()> {
        let shaft = self.bench.shaft.release_torque();
        let z = self.bench.z_axis.release_torque();
        shaft?;
        z?;
        debug!("All motors released");
        Ok(())
    }
}

fn required(value: Option<f64>, name: &str) -> BenchResult<f64> {
    value.ok_or_else(|| BenchError::InvalidRequest(format!("{} is required", name)))
}
