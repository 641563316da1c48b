//! Ready-made scanner model presets.
//!
//! A preset bundles the sensor and motor descriptors of a concrete scanner
//! with the device family that drives it.

use serde::{Deserialize, Serialize};

use crate::ccd::CcdCommandSet;
use crate::cis::CisCommandSet;
use crate::command_set::CommandSet;
use crate::descriptors::{
    MotorDescriptor, MotorSlope, NativeMode, SensorDescriptor, SensorKind, StepType,
    StepTypeRange,
};

/// Device family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFamily {
    Cis,
    Ccd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPreset {
    pub name: String,
    pub family: DeviceFamily,
    pub sensor: SensorDescriptor,
    pub motor: MotorDescriptor,
}

impl ModelPreset {
    /// Command set for this model's family.
    pub fn command_set(&self) -> Box<dyn CommandSet> {
        match self.family {
            DeviceFamily::Cis => Box::new(CisCommandSet::new()),
            DeviceFamily::Ccd => Box::new(CcdCommandSet::new()),
        }
    }
}

/// Every shipped preset.
pub fn all() -> Vec<ModelPreset> {
    vec![cis_a4_600(), ccd_flatbed_1200()]
}

/// Look up a preset by name, ignoring case.
pub fn by_name(name: &str) -> Option<ModelPreset> {
    all()
        .into_iter()
        .find(|preset| preset.name.eq_ignore_ascii_case(name))
}

/// A4 CIS scanner with a 600 dpi sensor.
pub fn cis_a4_600() -> ModelPreset {
    let sensor = SensorDescriptor {
        name: "CIS A4 600".to_string(),
        kind: SensorKind::Cis,
        optical_resolution: 600,
        native_modes: vec![
            NativeMode {
                resolution: 300,
                line_period: 4800,
                exposure: [1800, 1800, 1800],
            },
            NativeMode {
                resolution: 600,
                line_period: 9600,
                exposure: [3600, 3600, 3600],
            },
        ],
        pixel_count: 5136,
        black_pixels: 32,
        segment_count: 1,
        mirrored: false,
        line_distance: 0,
        stagger_lines: 0,
        line_alignment: 2,
        supports_xpa: false,
        supports_led_add: true,
    };

    let motor = MotorDescriptor {
        base_ydpi: 1200,
        step_types: vec![
            StepTypeRange {
                max_resolution: 300,
                step_type: StepType::Full,
            },
            StepTypeRange {
                max_resolution: 600,
                step_type: StepType::Half,
            },
            StepTypeRange {
                max_resolution: 1200,
                step_type: StepType::Quarter,
            },
        ],
        scan_slope: MotorSlope::from_steps(10_000, 800, 200),
        fast_slope: MotorSlope::from_steps(8_000, 500, 150),
        fast_step_type: StepType::Full,
        fast_speed_w: 600,
        acceleration_budget: 256,
        table_alignment: 4,
        min_table_size: 16,
        vref_thresholds: vec![4000, 2000],
        home_travel: 14_000,
    };

    ModelPreset {
        name: sensor.name.clone(),
        family: DeviceFamily::Cis,
        sensor,
        motor,
    }
}

/// Letter-size CCD flatbed with a 1200 dpi sensor and transparency adapter.
pub fn ccd_flatbed_1200() -> ModelPreset {
    let sensor = SensorDescriptor {
        name: "CCD Flatbed 1200".to_string(),
        kind: SensorKind::Ccd,
        optical_resolution: 1200,
        native_modes: vec![
            NativeMode {
                resolution: 300,
                line_period: 6000,
                exposure: [2400, 2400, 2400],
            },
            NativeMode {
                resolution: 600,
                line_period: 9000,
                exposure: [2400, 2400, 2400],
            },
            NativeMode {
                resolution: 1200,
                line_period: 16_000,
                exposure: [2400, 2400, 2400],
            },
        ],
        pixel_count: 10_240,
        black_pixels: 64,
        segment_count: 2,
        mirrored: false,
        line_distance: 24,
        stagger_lines: 4,
        line_alignment: 4,
        supports_xpa: true,
        supports_led_add: false,
    };

    let motor = MotorDescriptor {
        base_ydpi: 1200,
        step_types: vec![
            StepTypeRange {
                max_resolution: 300,
                step_type: StepType::Half,
            },
            StepTypeRange {
                max_resolution: 600,
                step_type: StepType::Quarter,
            },
            StepTypeRange {
                max_resolution: 1200,
                step_type: StepType::Eighth,
            },
        ],
        scan_slope: MotorSlope::from_steps(12_000, 700, 250),
        fast_slope: MotorSlope::from_steps(9_000, 500, 120),
        fast_step_type: StepType::Half,
        fast_speed_w: 700,
        acceleration_budget: 512,
        table_alignment: 2,
        min_table_size: 32,
        vref_thresholds: vec![6000, 3000, 1500],
        home_travel: 16_000,
    };

    ModelPreset {
        name: sensor.name.clone(),
        family: DeviceFamily::Ccd,
        sensor,
        motor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(by_name("cis a4 600").map(|p| p.family), Some(DeviceFamily::Cis));
        assert!(by_name("unknown").is_none());
    }

    #[test]
    fn test_native_modes_ascending() {
        for preset in all() {
            let resolutions: Vec<u32> = preset
                .sensor
                .native_modes
                .iter()
                .map(|m| m.resolution)
                .collect();
            let mut sorted = resolutions.clone();
            sorted.sort_unstable();
            assert_eq!(resolutions, sorted, "{}", preset.name);
        }
    }

    #[test]
    fn test_families_support_every_native_divisor() {
        for preset in all() {
            let cmd = preset.command_set();
            for mode in &preset.sensor.native_modes {
                let divisor = preset.sensor.divisor(mode.resolution);
                assert!(cmd.dpihw_code(divisor).is_some(), "{} {}", preset.name, divisor);
            }
            for range in &preset.motor.step_types {
                assert!(cmd.step_type_code(range.step_type).is_some());
            }
        }
    }
}
