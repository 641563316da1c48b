//! Command set for CCD flatbed families.
//!
//! CCD devices use a cold-cathode or LED lamp behind optics and read one
//! sensor row per color. Exposure is fixed by the line period, the Wolfson
//! style AFE has one gain register per channel, and a transparency adapter
//! (XPA) may replace the main lamp. Geometry fields are 24-bit MSB-first,
//! exposures are 16-bit LSB-first.

use shared::registers::{BitField, ByteOrder, RegisterSet, WideField};

use crate::command_set::{
    CalibrationTuning, CommandSet, GainCurve, GainTuning, OffsetTuning, ProgramContext,
    RegisterLayout, ShadingTuning,
};
use crate::descriptors::StepType;

/// Route lamp power to the transparency adapter.
const XPA_LAMP: BitField = BitField::flag(0x04, 0);
/// Correlated double sampling, needed below full optical resolution.
const CDS_ENABLE: BitField = BitField::flag(0x04, 1);

const WOLFSON_NUMERATOR: f64 = 208.0;
const WOLFSON_OFFSET: f64 = 283.0;

const SLOPE_BANK_BASE: u32 = 0x4000;
const SLOPE_BANK_STRIDE: u32 = 0x800;
const SHADING_BANK_BASE: u32 = 0x10_0000;
const SHADING_BANK_SIZE: u32 = 0x1_0000;

pub struct CcdCommandSet {
    layout: RegisterLayout,
    tuning: CalibrationTuning,
}

impl CcdCommandSet {
    pub fn new() -> Self {
        Self {
            layout: ccd_layout(),
            tuning: ccd_tuning(),
        }
    }
}

impl Default for CcdCommandSet {
    fn default() -> Self {
        Self::new()
    }
}

fn ccd_layout() -> RegisterLayout {
    RegisterLayout {
        scan_enable: BitField::flag(0x01, 0),
        motor_enable: BitField::flag(0x01, 1),
        shading_enable: BitField::flag(0x01, 2),
        lamp_enable: BitField::flag(0x01, 3),
        reverse: BitField::flag(0x01, 4),
        fast_feed: BitField::flag(0x01, 5),
        led_add: None,
        xpa: Some(BitField::flag(0x01, 6)),
        color: BitField::flag(0x02, 0),
        depth16: BitField::flag(0x02, 1),
        lineart: BitField::flag(0x02, 2),
        channel_select: BitField::code(0x02, 3, 2),
        step_type: BitField::code(0x02, 5, 2),
        dpihw: BitField::code(0x03, 0, 3),
        fast_step_type: BitField::code(0x03, 4, 2),
        vref: BitField::code(0x03, 6, 2),
        table_index: [
            BitField::code(0x05, 0, 2),
            BitField::code(0x05, 2, 2),
            BitField::code(0x05, 4, 2),
            BitField::code(0x06, 0, 2),
            BitField::code(0x06, 2, 2),
        ],
        dpiset: WideField::msb16(0x10),
        pixel_start: WideField::msb24(0x14),
        pixel_end: WideField::msb24(0x17),
        line_period: WideField::msb24(0x1a),
        exposure: [
            WideField::lsb16(0x20),
            WideField::lsb16(0x22),
            WideField::lsb16(0x24),
        ],
        line_count: WideField::msb24(0x28),
        feed: WideField::msb24(0x2c),
        scan_steps: WideField::msb16(0x30),
        decel_steps: WideField::msb16(0x32),
        fast_steps: WideField::msb16(0x34),
        z1: WideField::msb24(0x36),
        z2: WideField::msb24(0x39),
        line_bytes: WideField::msb24(0x3c),
        gain: [0x40, 0x41, 0x42],
        offset: [0x44, 0x45, 0x46],
    }
}

fn ccd_tuning() -> CalibrationTuning {
    CalibrationTuning {
        led: None,
        offset: OffsetTuning {
            search_low: 10,
            search_high: 255,
            max_passes: 32,
            dark_target: 2560,
        },
        gain: GainTuning {
            target: 50_000,
            min_code: 0,
            max_code: 255,
        },
        shading: ShadingTuning {
            lines: 8,
            unity: 0x4000,
            target: 0xfa00,
            dark_scan: true,
        },
        // unity gain on the Wolfson curve
        default_gain: 75,
        default_offset: 128,
    }
}

impl CommandSet for CcdCommandSet {
    fn name(&self) -> &str {
        "ccd"
    }

    fn baseline(&self) -> RegisterSet {
        let mut regs = RegisterSet::from_pairs(&[
            (0x01, 0x00),
            (0x02, 0x00),
            (0x03, 0x00),
            (0x04, 0x00),
            (0x05, 0x00),
            (0x06, 0x00),
            // CCD clock phases
            (0x08, 0x63),
            (0x09, 0x1c),
            (0x0a, 0x05),
        ]);
        for (&gain, &offset) in self.layout.gain.iter().zip(self.layout.offset.iter()) {
            regs.set(gain, self.tuning.default_gain);
            regs.set(offset, self.tuning.default_offset);
        }
        regs
    }

    fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    fn table_capacity(&self) -> usize {
        1024
    }

    fn physical_tables(&self) -> u8 {
        4
    }

    fn slope_table_bank(&self, slot: u8) -> u32 {
        SLOPE_BANK_BASE + u32::from(slot) * SLOPE_BANK_STRIDE
    }

    fn memory_order(&self) -> ByteOrder {
        ByteOrder::LsbFirst
    }

    fn shading_bank(&self, channel: usize) -> u32 {
        SHADING_BANK_BASE + channel as u32 * SHADING_BANK_SIZE
    }

    fn shading_bank_size(&self) -> u32 {
        SHADING_BANK_SIZE
    }

    fn dpihw_code(&self, divisor: u32) -> Option<u8> {
        match divisor {
            1 => Some(0),
            2 => Some(1),
            4 => Some(2),
            8 => Some(3),
            _ => None,
        }
    }

    fn step_type_code(&self, step_type: StepType) -> Option<u8> {
        Some(step_type.shift() as u8)
    }

    fn gain_curve(&self) -> GainCurve {
        GainCurve::Wolfson {
            numerator: WOLFSON_NUMERATOR,
            offset: WOLFSON_OFFSET,
        }
    }

    fn shares_gain(&self) -> bool {
        false
    }

    fn tuning(&self) -> &CalibrationTuning {
        &self.tuning
    }

    fn finish_program(&self, registers: &mut RegisterSet, ctx: &ProgramContext) {
        registers.set_flag(CDS_ENABLE, ctx.native_divisor > 1);

        // The adapter has its own lamp; the flatbed lamp stays dark.
        if ctx.xpa {
            let lamp_on = registers.flag(self.layout.lamp_enable);
            registers.set_flag(XPA_LAMP, lamp_on);
            registers.set_flag(self.layout.lamp_enable, false);
        } else {
            registers.set_flag(XPA_LAMP, false);
        }
    }

    fn lamp_on(&self, registers: &RegisterSet) -> bool {
        registers.flag(self.layout.lamp_enable) || registers.flag(XPA_LAMP)
    }
}
