mod common;

use hardware::models::{ccd_flatbed_1200, cis_a4_600};
use hardware::sim::SimulatedScanner;
use scan_engine::calibration::types::CalibrationValues;
use scan_engine::calibration::{CalibrationController, CalibrationStage};
use scan_engine::error::{CalibrationWarning, ScanError, StageName};
use scan_engine::executor::CancelToken;
use scan_engine::request::{ColorMode, ScanFlags};
use shared::device_interface::mock::{MockDevice, MockOp};

use common::{executor, simulated_device, strip};

fn controller(exec: &scan_engine::executor::ScanExecutor<MockDevice>) -> CalibrationController {
    CalibrationController::new(CalibrationValues::defaults(exec.command_set().tuning()))
}

#[test]
fn test_cis_calibration_converges() {
    let preset = cis_a4_600();
    let mut exec = executor(&preset, simulated_device(&preset));
    let target = exec.plan(&strip(300, ColorMode::Color)).unwrap();
    let mut controller = controller(&exec);

    let report = controller.run(&mut exec, &target).unwrap();

    assert_eq!(controller.stage(), CalibrationStage::Committed);
    assert!(report.warnings.is_empty());
    assert_eq!(report.values.offset, [80; 3]);
    let gain = report.values.gain;
    assert!(gain.iter().all(|&g| g == gain[0]));

    // The shading table lines up with the target window
    let shading = report.shading.unwrap();
    let bank = preset.command_set().shading_bank(0) + target.window_start * 4;
    assert!(exec.device().bulk_writes().iter().any(|(addr, _)| *addr == bank));
    assert_eq!(shading.window_start, target.window_start);
}

#[test]
fn test_ccd_calibration_converges() {
    let preset = ccd_flatbed_1200();
    let mut exec = executor(&preset, simulated_device(&preset));
    let target = exec.plan(&strip(600, ColorMode::Color)).unwrap();
    let mut controller = controller(&exec);

    let report = controller.run(&mut exec, &target).unwrap();

    assert!(report.warnings.is_empty());
    assert_eq!(report.values.exposure, None);
    assert_eq!(report.values.offset, [80; 3]);
    let gain = report.values.gain;
    assert!(gain[2] > gain[0] && gain[0] > gain[1]);
    assert_eq!(report.shading.unwrap().rows.len(), 3);
}

#[test]
fn test_offset_converges_within_nine_scans() {
    let preset = ccd_flatbed_1200();
    let mut exec = executor(&preset, simulated_device(&preset));
    let request = strip(300, ColorMode::Gray).with_flags(ScanFlags {
        disable_shading: true,
        ..Default::default()
    });
    let target = exec.plan(&request).unwrap();

    controller(&exec).run(&mut exec, &target).unwrap();

    // Offset passes plus one gain scan; no LED stage on CCD
    let scans = exec.device().calls(MockOp::ReadImage);
    assert!(scans >= 2);
    assert!(scans - 1 <= 9, "offset took {} scans", scans - 1);
}

#[test]
fn test_dim_sensor_clamps_gain_and_degrades_led() {
    let preset = cis_a4_600();
    let scanner = SimulatedScanner::for_preset(&preset).with_response([0.01; 3]);
    let mut exec = executor(&preset, MockDevice::new(Box::new(scanner)));
    let target = exec.plan(&strip(300, ColorMode::Color)).unwrap();
    let mut controller = controller(&exec);

    let report = controller.run(&mut exec, &target).unwrap();

    assert_eq!(controller.stage(), CalibrationStage::Committed);
    assert_eq!(report.values.gain, [255; 3]);
    assert_eq!(report.values.exposure, Some([target.line_period as u16; 3]));
    assert!(report.warnings.iter().any(|w| matches!(
        w,
        CalibrationWarning::Degraded {
            stage: StageName::LedExposure,
            ..
        }
    )));
}

#[test]
fn test_cancel_mid_calibration_stops_once() {
    let preset = cis_a4_600();
    let cancel = CancelToken::new();
    let hook_cancel = cancel.clone();
    let device = simulated_device(&preset).on_image_read(move |reads| {
        if reads == 3 {
            hook_cancel.cancel();
        }
    });
    let mut exec = executor(&preset, device).with_cancel_token(cancel);
    let target = exec.plan(&strip(300, ColorMode::Color)).unwrap();
    let mut controller = controller(&exec);
    let before = controller.values().clone();

    assert_eq!(controller.run(&mut exec, &target), Err(ScanError::Cancelled));

    assert_eq!(controller.stage(), CalibrationStage::Idle);
    assert_eq!(exec.device().calls(MockOp::StopMotion), 1);
    assert_eq!(exec.device().calls(MockOp::ReadImage), 3);
    assert!(exec.active_session().is_none());
    assert_eq!(controller.values(), &before);
}

#[test]
fn test_io_error_fails_calibration() {
    let preset = cis_a4_600();
    let device = simulated_device(&preset).fail_on(MockOp::ReadImage, 2);
    let mut exec = executor(&preset, device);
    let target = exec.plan(&strip(300, ColorMode::Color)).unwrap();
    let mut controller = controller(&exec);

    let err = controller.run(&mut exec, &target).unwrap_err();

    assert!(matches!(err, ScanError::Io(_)));
    assert_eq!(controller.stage(), CalibrationStage::Failed);
    assert_eq!(exec.device().calls(MockOp::StopMotion), 1);
    assert!(exec.active_session().is_none());
}

#[test]
fn test_stuck_motor_times_out() {
    let preset = ccd_flatbed_1200();
    let device = simulated_device(&preset).with_motion_polls(usize::MAX);
    let mut exec = executor(&preset, device);
    let target = exec.plan(&strip(300, ColorMode::Gray)).unwrap();
    let mut controller = controller(&exec);

    let err = controller.run(&mut exec, &target).unwrap_err();

    assert!(matches!(err, ScanError::Timeout { .. }));
    assert_eq!(controller.stage(), CalibrationStage::Failed);
    assert_eq!(exec.device().calls(MockOp::ReadImage), 1);
    assert_eq!(exec.device().calls(MockOp::StopMotion), 1);
}
