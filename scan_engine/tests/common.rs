//! Shared fixtures for scan engine integration tests.

#![allow(dead_code)]

use std::time::Duration;

use hardware::models::ModelPreset;
use hardware::sim::SimulatedScanner;
use scan_engine::driver::{DriverConfig, ScanDriver};
use scan_engine::executor::{ScanExecutor, WaitSettings};
use scan_engine::request::{ColorMode, ScanArea, ScanRequest};
use shared::device_interface::mock::MockDevice;

/// Waits that never sleep and give up quickly.
pub fn fast_waits() -> WaitSettings {
    WaitSettings {
        poll_interval: Duration::ZERO,
        motion_timeout: Duration::from_millis(300),
        lamp_timeout: Duration::from_millis(300),
        home_timeout: Duration::from_millis(300),
    }
}

pub fn fast_config() -> DriverConfig {
    let waits = fast_waits();
    DriverConfig {
        poll_interval: waits.poll_interval,
        motion_timeout: waits.motion_timeout,
        lamp_timeout: waits.lamp_timeout,
        home_timeout: waits.home_timeout,
        ..Default::default()
    }
}

pub fn simulated_device(preset: &ModelPreset) -> MockDevice {
    MockDevice::new(Box::new(SimulatedScanner::for_preset(preset)))
}

pub fn executor(preset: &ModelPreset, device: MockDevice) -> ScanExecutor<MockDevice> {
    ScanExecutor::new(
        device,
        preset.command_set(),
        preset.sensor.clone(),
        preset.motor.clone(),
    )
    .with_wait_settings(fast_waits())
}

pub fn driver(preset: &ModelPreset, device: MockDevice) -> ScanDriver<MockDevice> {
    ScanDriver::new(device, preset, fast_config())
}

/// US letter at `resolution` from the scan origin.
pub fn letter(resolution: u32, mode: ColorMode, depth: u8) -> ScanRequest {
    ScanRequest::new(
        resolution,
        ScanArea::from_inches(0.0, 0.0, 8.5, 11.0),
        mode,
        depth,
    )
}

/// Small area used where only calibration behavior matters.
pub fn strip(resolution: u32, mode: ColorMode) -> ScanRequest {
    ScanRequest::new(
        resolution,
        ScanArea::from_inches(1.0, 0.25, 2.0, 0.5),
        mode,
        8,
    )
}
