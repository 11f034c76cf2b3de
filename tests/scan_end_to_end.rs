//! End-to-end scans against the mock bench.

mod common;

use common::{data_lines, fields, Rig, RigBuilder};
use rotor_bench::hardware::mock::{MockLimitSwitch, MockMotor};
use rotor_bench::hardware::MotorProfile;
use rotor_bench::scan::{ScanMode, ScanOutcome, ScanRequest, StopHandle};
use rotor_bench::timing::Clock;
use rotor_bench::BenchError;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

fn grid_request(mode: ScanMode, rotation_step_deg: f64, z: &[f64]) -> ScanRequest {
    ScanRequest {
        mode,
        working_distance_mm: 30.0,
        rotation_step_deg,
        z_positions_mm: z.to_vec(),
        repeat_count: 1,
        ..Default::default()
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "{} != {}",
        actual,
        expected
    );
}

#[test]
fn test_by_angle_two_planes_three_angles() {
    let rig = RigBuilder::new().build();
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0, 30.0]);

    let report = rig.orchestrator.run(&request).expect("Scan failed");
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.data_lines, 6);
    assert_eq!(report.homes, 1);

    let lines = data_lines(&report.files[0]);
    assert_eq!(lines.len(), 6);
    let tags: Vec<(f64, f64)> = lines
        .iter()
        .map(|line| {
            let f = fields(line);
            (f[0], f[1])
        })
        .collect();
    assert_eq!(
        tags,
        vec![
            (0.0, 0.0),
            (0.0, 120.0),
            (0.0, 240.0),
            (1.0, 0.0),
            (1.0, 120.0),
            (1.0, 240.0)
        ]
    );
    for line in &lines {
        let f = fields(line);
        assert_eq!(f.len(), 5);
        assert_close(f[2], 10.0);
        assert_close(f[3], -5.0);
        assert_close(f[4], 2.5);
    }

    // Six 120° steps of the geared shaft, one move down to 30 mm
    assert_eq!(rig.shaft.step.rising_edges(), 6 * 400);
    assert_eq!(rig.z.step.rising_edges(), 191);
    assert!(!rig.shaft.torque_engaged());
    assert!(!rig.z.torque_engaged());
    assert_eq!(rig.port.count_commands("RM"), 6);
}

#[test]
fn test_by_angle_header() {
    let rig = RigBuilder::new().build();
    let port = rig.port.clone();
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    let text = std::fs::read_to_string(&report.files[0]).expect("Failed to read file");
    let header: Vec<&str> = text.lines().take_while(|l| l.starts_with('#')).collect();
    assert!(header[0].starts_with("# CAL X"));
    assert!(header.contains(&"# SENSOR_NB_SAMPLE: 10"));
    assert!(header.contains(&"# working dist: 30 mm"));
    assert!(header.contains(&"# sensor pos #2: 30 mm"));
    assert_eq!(
        header.last().copied(),
        Some("# ZPos#; a[°]; X1_magn[mT]; Y1_magn[mT]; Z1_magn[mT]")
    );
    assert!(text.lines().last().unwrap_or_default().starts_with("# Measurement duration:"));

    // Calibration queried once, at initialisation
    assert_eq!(port.count_commands("PC"), 1);
}

#[test]
fn test_by_zpos_lists_triples_in_list_order() {
    // Reading n reports X = n mT
    let rig = RigBuilder::new()
        .generator(Box::new(|n| (n as f64 * 10.0, 0.0, 0.0)))
        .build();
    let request = grid_request(ScanMode::ByZPos, 120.0, &[10.0, 30.0, 60.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    let lines = data_lines(&report.files[0]);
    assert_eq!(lines.len(), 3);

    let xs = |line: &str| -> Vec<f64> {
        let f = fields(line);
        vec![f[1], f[4], f[7]]
    };
    // Step 0 visits 10, 30, 60; step 1 visits 60, 30, 10; step 2 ascends again
    assert_eq!(xs(&lines[0]), vec![0.0, 1.0, 2.0]);
    assert_eq!(xs(&lines[1]), vec![5.0, 4.0, 3.0]);
    assert_eq!(xs(&lines[2]), vec![6.0, 7.0, 8.0]);
    assert_eq!(fields(&lines[1])[0], 120.0);
}

#[test]
fn test_by_zpos_rehoming_cadence() {
    let rig = RigBuilder::new().build();
    let request = grid_request(ScanMode::ByZPos, 4.8, &[0.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    // 75 angle steps, re-homed at 0, 10, ..., 70
    assert_eq!(report.data_lines, 75);
    assert_eq!(report.homes, 8);
    assert_eq!(rig.shaft.step.rising_edges(), 75 * 16);
}

#[test]
fn test_by_zpos_rehoming_follows_config() {
    let rig = RigBuilder::new()
        .config(|c| c.z_axis.rehome_every_rot_steps = 25)
        .build();
    let request = grid_request(ScanMode::ByZPos, 4.8, &[0.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");
    assert_eq!(report.homes, 3);
}

#[test]
fn test_single_plane_keeps_one_second_cadence() {
    let rig = RigBuilder::new().build();
    let clock = rig.clock.clone();
    let start = clock.now();
    let request = grid_request(ScanMode::ByZPos, 90.0, &[0.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");
    assert_eq!(report.data_lines, 4);
    assert!(clock.now() - start >= Duration::from_secs(4));
}

#[test]
fn test_repetitions_write_distinct_files() {
    let rig = RigBuilder::new().build();
    let request = ScanRequest {
        repeat_count: 2,
        ..grid_request(ScanMode::ByAngle, 180.0, &[0.0])
    };
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.files.len(), 2);
    assert_ne!(report.files[0], report.files[1]);
    let first = report.files[0].file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let second = report.files[1].file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(first.contains("_ByAngle_WDIST-30_ROTSTEP-180.0_000_1of2"));
    assert!(second.ends_with("_2of2.txt"));
    assert_eq!(report.homes, 2);
    assert_eq!(report.data_lines, 4);
}

#[test]
fn test_malformed_reply_is_retried() {
    let rig = RigBuilder::new().reply("RD1,2\r\n").build();
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");
    assert_eq!(report.data_lines, 6);
    assert_eq!(rig.port.count_commands("RM"), 7);
}

#[test]
fn test_persistent_garbage_aborts_and_releases() {
    let mut builder = RigBuilder::new();
    for _ in 0..3 {
        builder = builder.reply("no marker\r\n");
    }
    let rig = builder.build();
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0, 30.0]);

    let result = rig.orchestrator.run(&request);
    assert!(matches!(
        result,
        Err(BenchError::SensorRetriesExhausted { attempts: 3, .. })
    ));
    assert!(!rig.shaft.torque_engaged());
    assert!(!rig.z.torque_engaged());

    // The partial file is still closed with its trailer
    let dir = rig.dir.path().join("TXT");
    let files: Vec<_> = std::fs::read_dir(dir)
        .expect("Output dir missing")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(files.len(), 1);
    let text = std::fs::read_to_string(files[0].path()).expect("Failed to read file");
    assert!(text.contains("# Measurement duration:"));
}

#[test]
fn test_homing_timeout_surfaces() {
    let rig = RigBuilder::new()
        .switch(MockLimitSwitch::never_pressed())
        .config(|c| c.z_axis.homing_timeout_s = Some(2.0))
        .build();
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0]);

    match rig.orchestrator.run(&request) {
        Err(BenchError::HomingTimeout { elapsed }) => assert!(elapsed > Duration::from_secs(2)),
        other => panic!("expected a homing timeout, got {:?}", other),
    }
    assert!(!rig.z.torque_engaged());
    assert!(rig.switch.polls() > 1);
}

/// Rig whose sensor raises the emergency stop while taking reading `at`.
fn rig_stopping_at(at: u64) -> Rig {
    let stop: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    let trigger = Arc::clone(&stop);
    let rig = RigBuilder::new()
        .generator(Box::new(move |n| {
            if n == at {
                if let Some(handle) = trigger.get() {
                    handle.request();
                }
            }
            (1.0, 1.0, 1.0)
        }))
        .build();
    stop.set(rig.orchestrator.stop_handle())
        .expect("Stop handle already set");
    rig
}

#[test]
fn test_emergency_stop_between_steps() {
    let rig = rig_stopping_at(3);
    let request = grid_request(ScanMode::ByAngle, 120.0, &[0.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.outcome, ScanOutcome::Stopped);
    assert!(report.final_state.emergency_stop_required);
    // The fourth reading is written, but the shaft does not turn after it
    assert_eq!(report.data_lines, 4);
    assert_eq!(rig.port.count_commands("RM"), 4);
    let pulses_per_step = MotorProfile::shaft().pulses_for_rotation(120.0) as u64;
    assert_eq!(rig.shaft.step.rising_edges(), 3 * pulses_per_step);
    assert!(!rig.shaft.torque_engaged());
    assert!(!rig.z.torque_engaged());
}

#[test]
fn test_emergency_stop_inside_z_sweep() {
    let rig = rig_stopping_at(0);
    let request = grid_request(ScanMode::ByZPos, 120.0, &[10.0, 30.0, 60.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.outcome, ScanOutcome::Stopped);
    assert_eq!(rig.port.count_commands("RM"), 1);
    // Only the move down to the first plane, no shaft step
    let first_move = MotorProfile::z_axis().pulses_for_distance(10.0).unwrap_or_default() as u64;
    assert_eq!(rig.z.step.rising_edges(), first_move);
    assert_eq!(rig.shaft.step.rising_edges(), 0);

    // The incomplete angle step is not written, the file is still closed
    assert_eq!(report.data_lines, 0);
    assert_eq!(report.files.len(), 1);
    let text = std::fs::read_to_string(&report.files[0]).expect("Failed to read file");
    assert!(text.contains("# Measurement duration:"));
    assert!(!rig.z.torque_engaged());
}

#[test]
fn test_emergency_stop_during_free_run() {
    let rig = rig_stopping_at(2);
    let request = ScanRequest {
        mode: ScanMode::Free,
        duration_s: Some(10.0),
        sampling_interval_s: Some(1.0),
        repeat_count: 2,
        ..Default::default()
    };
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.outcome, ScanOutcome::Stopped);
    assert_eq!(report.data_lines, 3);
    assert_eq!(report.files.len(), 1);
    assert_eq!(rig.port.count_commands("RM"), 3);
}

#[test]
fn test_stop_request_releases_torque_at_once() {
    type Observed = ((bool, bool), (bool, bool));
    let wiring: Arc<OnceLock<(StopHandle, MockMotor, MockMotor)>> = Arc::new(OnceLock::new());
    let seen: Arc<Mutex<Vec<Observed>>> = Arc::new(Mutex::new(Vec::new()));
    let (trigger, record) = (Arc::clone(&wiring), Arc::clone(&seen));

    let rig = RigBuilder::new()
        .generator(Box::new(move |n| {
            if n == 1 {
                if let Some((stop, shaft, z)) = trigger.get() {
                    let before = (shaft.torque_engaged(), z.torque_engaged());
                    stop.request();
                    let after = (shaft.torque_engaged(), z.torque_engaged());
                    record.lock().expect("Observation lock poisoned").push((before, after));
                }
            }
            (1.0, 1.0, 1.0)
        }))
        .build();
    wiring
        .set((rig.orchestrator.stop_handle(), rig.shaft.clone(), rig.z.clone()))
        .map_err(|_| "wiring already set")
        .expect("Failed to wire the stop");

    let request = grid_request(ScanMode::ByZPos, 120.0, &[10.0, 30.0]);
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.outcome, ScanOutcome::Stopped);
    // Both motors held while sampling, both released before request() returned
    assert_eq!(
        *seen.lock().expect("Observation lock poisoned"),
        vec![((true, true), (false, false))]
    );
}

#[test]
fn test_invalid_free_overrides_are_rejected() {
    let rig = RigBuilder::new().build();
    let request = ScanRequest {
        mode: ScanMode::Free,
        duration_s: Some(5.0),
        sampling_interval_s: Some(1.0),
        gain: Some(3),
        ..Default::default()
    };
    assert!(matches!(
        rig.orchestrator.run(&request),
        Err(BenchError::InvalidRequest(_))
    ));
    assert!(!rig.port.commands().contains(&"PG 3".to_string()));
    assert_eq!(rig.port.count_commands("RM"), 0);
}

#[test]
fn test_free_run_cadence_and_overrides() {
    let rig = RigBuilder::new().build();
    let request = ScanRequest {
        mode: ScanMode::Free,
        duration_s: Some(5.0),
        sampling_interval_s: Some(1.0),
        sample_count: Some(20),
        gain: Some(2),
        read_delay_s: Some(0.5),
        repeat_count: 1,
        ..Default::default()
    };
    let report = rig.orchestrator.run(&request).expect("Scan failed");

    assert_eq!(report.data_lines, 5);
    let name = report.files[0].file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with("FREE_"));
    assert!(name.contains("_SMPL-020_GAIN-02_DELAY-0.50_1of1"));

    let times: Vec<f64> = data_lines(&report.files[0])
        .iter()
        .map(|line| fields(line)[0])
        .collect();
    assert_eq!(times, vec![0.5, 1.5, 2.5, 3.5, 4.5]);

    let commands = rig.port.commands();
    assert!(commands.contains(&"NS 20".to_string()));
    assert!(commands.contains(&"PG 2".to_string()));
    assert_eq!(rig.z.step.rising_edges(), 0);
    assert_eq!(rig.shaft.step.rising_edges(), 0);
}

#[test]
fn test_release_motors_request() {
    let rig = RigBuilder::new().build();
    let request = ScanRequest {
        mode: ScanMode::ReleaseMotors,
        ..Default::default()
    };
    let report = rig.orchestrator.run(&request).expect("Scan failed");
    assert!(report.files.is_empty());
    assert!(!rig.dir.path().join("TXT").exists());
}
