//! Device-family capability interface.
//!
//! Scanner ASICs of one family share a register map, memory layout and a set
//! of empirically tuned calibration constants. A [`CommandSet`] bundles that
//! knowledge so the motor, session, program and calibration code can be
//! written once and stay free of per-family branches.

use serde::{Deserialize, Serialize};
use shared::registers::{BitField, ByteOrder, RegisterSet, WideField};

use crate::descriptors::StepType;

/// Logical motion tables a register program refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlopeTableKind {
    /// Acceleration into the imaging speed
    Scan,
    /// Short reverse move cancelling backlash
    Backtrack,
    /// Deceleration at the end of a move
    Stop,
    /// Fast feed to the scan area
    Fast,
    /// Return to the home sensor
    Home,
}

impl SlopeTableKind {
    pub const ALL: [SlopeTableKind; 5] = [
        SlopeTableKind::Scan,
        SlopeTableKind::Backtrack,
        SlopeTableKind::Stop,
        SlopeTableKind::Fast,
        SlopeTableKind::Home,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where each programmable quantity lives in the family's register map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterLayout {
    pub scan_enable: BitField,
    pub motor_enable: BitField,
    pub shading_enable: BitField,
    pub lamp_enable: BitField,
    pub reverse: BitField,
    pub fast_feed: BitField,
    /// True-gray mode with all LEDs lit, if the family has it
    pub led_add: Option<BitField>,
    /// Transparency adapter lamp and optics, if the family has it
    pub xpa: Option<BitField>,
    pub color: BitField,
    pub depth16: BitField,
    pub lineart: BitField,
    pub channel_select: BitField,
    pub step_type: BitField,
    pub fast_step_type: BitField,
    pub vref: BitField,
    pub dpihw: BitField,
    /// Physical table slot per logical table, indexed by [`SlopeTableKind::index`]
    pub table_index: [BitField; 5],
    pub dpiset: WideField,
    pub pixel_start: WideField,
    pub pixel_end: WideField,
    pub line_period: WideField,
    pub exposure: [WideField; 3],
    pub line_count: WideField,
    pub line_bytes: WideField,
    pub feed: WideField,
    pub scan_steps: WideField,
    pub decel_steps: WideField,
    pub fast_steps: WideField,
    pub z1: WideField,
    pub z2: WideField,
    /// Gain registers per channel; shared-gain families repeat one address
    pub gain: [u16; 3],
    pub offset: [u16; 3],
}

/// Analog front-end gain transfer curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GainCurve {
    /// factor = 1 + code * step
    Linear { step: f64 },
    /// factor = numerator / (offset - code)
    Wolfson { numerator: f64, offset: f64 },
}

impl GainCurve {
    /// Amplification applied at a gain code.
    pub fn factor(&self, code: u8) -> f64 {
        let code = f64::from(code);
        match *self {
            GainCurve::Linear { step } => 1.0 + code * step,
            GainCurve::Wolfson { numerator, offset } => numerator / (offset - code).max(1.0),
        }
    }

    /// Real-valued code producing `factor`, before rounding and clamping.
    pub fn code_for(&self, factor: f64) -> f64 {
        if !factor.is_finite() {
            return f64::INFINITY;
        }
        match *self {
            GainCurve::Linear { step } => (factor - 1.0) / step,
            GainCurve::Wolfson { numerator, offset } => {
                if factor <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    offset - numerator / factor
                }
            }
        }
    }
}

/// LED exposure calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedTuning {
    pub target_low: u16,
    pub target_high: u16,
    pub max_iterations: u32,
    pub min_exposure: u16,
}

/// Offset (black level) calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetTuning {
    pub search_low: u8,
    pub search_high: u8,
    pub max_passes: u32,
    /// Desired dark level in 16-bit sample units
    pub dark_target: u16,
}

/// Gain calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainTuning {
    /// Desired white level in 16-bit sample units
    pub target: u16,
    pub min_code: u8,
    pub max_code: u8,
}

/// Shading calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadingTuning {
    /// Lines averaged per reference scan
    pub lines: u32,
    /// Coefficient meaning "multiply by one"
    pub unity: u16,
    /// Level a corrected white pixel should reach
    pub target: u16,
    /// Take a lamp-off reference instead of assuming a flat dark level
    pub dark_scan: bool,
}

/// Empirically tuned calibration constants of a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTuning {
    pub led: Option<LedTuning>,
    pub offset: OffsetTuning,
    pub gain: GainTuning,
    pub shading: ShadingTuning,
    pub default_gain: u8,
    pub default_offset: u8,
}

/// Session facts a family may need when finishing a register program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramContext {
    pub native_divisor: u32,
    pub channels: u8,
    pub depth: u8,
    pub led_add: bool,
    pub xpa: bool,
    pub single_line: bool,
    pub feeding_only: bool,
}

/// Capability interface implemented once per device family.
pub trait CommandSet: Send + Sync {
    /// Family name used in logs
    fn name(&self) -> &str;

    /// Baseline register template every program starts from
    fn baseline(&self) -> RegisterSet;

    fn layout(&self) -> &RegisterLayout;

    /// Maximum entries per physical slope table
    fn table_capacity(&self) -> usize;

    /// Number of physical slope tables in device memory
    fn physical_tables(&self) -> u8;

    /// Memory address of a physical slope table
    fn slope_table_bank(&self, slot: u8) -> u32;

    /// Byte order of 16-bit words in device memory
    fn memory_order(&self) -> ByteOrder;

    /// Memory address of the shading bank for a channel
    fn shading_bank(&self, channel: usize) -> u32;

    /// Size in bytes of one shading bank
    fn shading_bank_size(&self) -> u32;

    /// DPIHW code for an optical/native divisor
    fn dpihw_code(&self, divisor: u32) -> Option<u8>;

    fn step_type_code(&self, step_type: StepType) -> Option<u8>;

    fn gain_curve(&self) -> GainCurve;

    /// One gain control drives all channels
    fn shares_gain(&self) -> bool;

    fn tuning(&self) -> &CalibrationTuning;

    /// Family-specific edits applied after the generic program is laid down
    fn finish_program(&self, _registers: &mut RegisterSet, _ctx: &ProgramContext) {}

    /// Whether a register program lights the document
    fn lamp_on(&self, registers: &RegisterSet) -> bool {
        registers.flag(self.layout().lamp_enable)
    }
}
