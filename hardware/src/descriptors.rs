//! Sensor and motor descriptions for a scanner model.
//!
//! These are plain data: the numbers come from the model's datasheet or from
//! empirical tuning, and everything downstream (session planning, motor ramps,
//! calibration) is computed from them.

use serde::{Deserialize, Serialize};

/// Physical sensor technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    /// Contact image sensor lit by switchable RGB LEDs
    Cis,
    /// CCD line sensor behind a lamp and optics, one row per color
    Ccd,
}

/// A hardware-native horizontal resolution the sensor can be clocked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeMode {
    /// Native resolution in dpi
    pub resolution: u32,
    /// Line period in pixel-clock ticks
    pub line_period: u32,
    /// Default per-channel exposure (LED on-time) in ticks
    pub exposure: [u16; 3],
}

/// Geometry and timing of the image sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Human-readable sensor name, also the calibration cache key
    pub name: String,
    pub kind: SensorKind,
    /// Physical resolution across the sensor in dpi
    pub optical_resolution: u32,
    /// Supported native modes, ascending by resolution
    pub native_modes: Vec<NativeMode>,
    /// Active pixels at optical resolution
    pub pixel_count: u32,
    /// Masked pixels preceding the active area at optical resolution
    pub black_pixels: u32,
    /// Number of segments read out in parallel
    pub segment_count: u32,
    /// Pixels are read out from the far edge
    pub mirrored: bool,
    /// Distance in lines between color rows at the motor base resolution
    pub line_distance: u32,
    /// Stagger between odd and even pixels in lines at the motor base resolution
    pub stagger_lines: u32,
    /// Output line byte alignment
    pub line_alignment: u32,
    /// Transparency adapter available
    pub supports_xpa: bool,
    /// LEDs can be switched on together for true gray scans
    pub supports_led_add: bool,
}

impl SensorDescriptor {
    /// Divisor between optical and native resolution.
    pub fn divisor(&self, native_resolution: u32) -> u32 {
        (self.optical_resolution / native_resolution.max(1)).max(1)
    }
}

/// Motor microstep granularity.
///
/// The discriminant is the right shift applied to full-step intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepType {
    Full = 0,
    Half = 1,
    Quarter = 2,
    Eighth = 3,
}

impl StepType {
    pub fn shift(self) -> u32 {
        self as u32
    }

    /// Microsteps per full step.
    pub fn microsteps(self) -> u32 {
        1 << self.shift()
    }
}

/// Acceleration curve of the motor.
///
/// Speeds are expressed as intervals ("w") in timer ticks per full step, so a
/// smaller number is a faster motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSlope {
    /// Interval the motor can start from standstill with
    pub base_speed_w: u32,
    /// Fastest interval the motor can sustain
    pub max_speed_w: u32,
    /// Acceleration in (1/tick)^2 per step
    pub acceleration: f64,
}

impl MotorSlope {
    /// Slope reaching `max_speed_w` from `base_speed_w` in `steps` steps.
    pub fn from_steps(base_speed_w: u32, max_speed_w: u32, steps: u32) -> Self {
        let v0 = 1.0 / f64::from(base_speed_w.max(1));
        let v1 = 1.0 / f64::from(max_speed_w.max(1));
        let acceleration = (v1 * v1 - v0 * v0) / (2.0 * f64::from(steps.max(1)));
        Self {
            base_speed_w,
            max_speed_w,
            acceleration,
        }
    }
}

/// Step type used up to a given vertical resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTypeRange {
    pub max_resolution: u32,
    pub step_type: StepType,
}

/// Motor, drive train and motion-table constraints of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorDescriptor {
    /// Full steps per inch of carriage travel
    pub base_ydpi: u32,
    /// Step type per vertical resolution range, ascending
    pub step_types: Vec<StepTypeRange>,
    /// Slope used while imaging
    pub scan_slope: MotorSlope,
    /// Slope used for feeding and homing
    pub fast_slope: MotorSlope,
    pub fast_step_type: StepType,
    /// Cruise interval for fast moves in ticks per full step
    pub fast_speed_w: u32,
    /// Maximum ramp length in table entries
    pub acceleration_budget: u32,
    /// Scan tables are padded to a multiple of this many entries
    pub table_alignment: u32,
    /// Minimum scan table length
    pub min_table_size: u32,
    /// Interval thresholds (ticks per full step) selecting the velocity reference code
    pub vref_thresholds: Vec<u32>,
    /// Full steps of reverse travel allowed when seeking home
    pub home_travel: u32,
}

impl MotorDescriptor {
    /// Step type for a vertical resolution, if the motor supports it.
    pub fn step_type_for(&self, yres: u32) -> Option<StepType> {
        self.step_types
            .iter()
            .find(|r| r.max_resolution >= yres)
            .map(|r| r.step_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_step_type_shift() {
        assert_eq!(StepType::Full.microsteps(), 1);
        assert_eq!(StepType::Quarter.microsteps(), 4);
        assert_eq!(StepType::Eighth.shift(), 3);
    }

    #[test]
    fn test_slope_from_steps_reaches_max_speed() {
        let slope = MotorSlope::from_steps(10_000, 800, 200);
        let v0 = 1.0 / 10_000.0_f64;
        let v = (v0 * v0 + 2.0 * slope.acceleration * 200.0).sqrt();
        assert_relative_eq!(1.0 / v, 800.0, max_relative = 1e-9);
    }

    #[test]
    fn test_step_type_lookup() {
        let motor = MotorDescriptor {
            base_ydpi: 1200,
            step_types: vec![
                StepTypeRange {
                    max_resolution: 300,
                    step_type: StepType::Full,
                },
                StepTypeRange {
                    max_resolution: 1200,
                    step_type: StepType::Quarter,
                },
            ],
            scan_slope: MotorSlope::from_steps(10_000, 800, 200),
            fast_slope: MotorSlope::from_steps(8_000, 500, 100),
            fast_step_type: StepType::Full,
            fast_speed_w: 600,
            acceleration_budget: 256,
            table_alignment: 4,
            min_table_size: 16,
            vref_thresholds: vec![],
            home_travel: 20_000,
        };
        assert_eq!(motor.step_type_for(150), Some(StepType::Full));
        assert_eq!(motor.step_type_for(600), Some(StepType::Quarter));
        assert_eq!(motor.step_type_for(2400), None);
    }
}
