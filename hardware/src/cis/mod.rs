//! Command set for contact-image-sensor (CIS) families.
//!
//! CIS devices light the page with switchable red, green and blue LEDs, so
//! exposure is the LED on-time per channel and can be calibrated. One AFE gain
//! control is shared by all three channels. Geometry fields are 16-bit
//! LSB-first, while the line count and feed are 24-bit MSB-first.

use shared::registers::{BitField, ByteOrder, RegisterSet, WideField};

use crate::command_set::{
    CalibrationTuning, CommandSet, GainCurve, GainTuning, LedTuning, OffsetTuning,
    ProgramContext, RegisterLayout, ShadingTuning,
};
use crate::descriptors::StepType;

/// AFE three-channel sampling mode.
const AFE_COLOR: BitField = BitField::flag(0x04, 0);
/// Light all LEDs during every line period.
const LED_ALL_ON: BitField = BitField::flag(0x04, 1);

const SLOPE_BANK_BASE: u32 = 0x2000;
const SLOPE_BANK_STRIDE: u32 = 0x400;
const SHADING_BANK_BASE: u32 = 0x8_0000;
const SHADING_BANK_SIZE: u32 = 0x8000;

pub struct CisCommandSet {
    layout: RegisterLayout,
    tuning: CalibrationTuning,
}

impl CisCommandSet {
    pub fn new() -> Self {
        Self {
            layout: cis_layout(),
            tuning: cis_tuning(),
        }
    }
}

impl Default for CisCommandSet {
    fn default() -> Self {
        Self::new()
    }
}

fn cis_layout() -> RegisterLayout {
    RegisterLayout {
        scan_enable: BitField::flag(0x01, 0),
        motor_enable: BitField::flag(0x01, 1),
        shading_enable: BitField::flag(0x01, 2),
        lamp_enable: BitField::flag(0x01, 3),
        reverse: BitField::flag(0x01, 4),
        fast_feed: BitField::flag(0x01, 5),
        led_add: Some(BitField::flag(0x01, 6)),
        xpa: None,
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
        dpiset: WideField::lsb16(0x08),
        pixel_start: WideField::lsb16(0x0a),
        pixel_end: WideField::lsb16(0x0c),
        line_period: WideField::lsb16(0x0e),
        exposure: [
            WideField::lsb16(0x10),
            WideField::lsb16(0x12),
            WideField::lsb16(0x14),
        ],
        line_bytes: WideField::lsb16(0x16),
        line_count: WideField::msb24(0x18),
        feed: WideField::msb24(0x1c),
        scan_steps: WideField::lsb16(0x20),
        decel_steps: WideField::lsb16(0x22),
        fast_steps: WideField::lsb16(0x24),
        z1: WideField::lsb16(0x26),
        z2: WideField::lsb16(0x28),
        gain: [0x30, 0x30, 0x30],
        offset: [0x31, 0x32, 0x33],
    }
}

fn cis_tuning() -> CalibrationTuning {
    CalibrationTuning {
        led: Some(LedTuning {
            target_low: 40_000,
            target_high: 48_000,
            max_iterations: 100,
            min_exposure: 200,
        }),
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
            unity: 0x2000,
            target: 0xfa00,
            dark_scan: false,
        },
        default_gain: 16,
        default_offset: 128,
    }
}

impl CommandSet for CisCommandSet {
    fn name(&self) -> &str {
        "cis"
    }

    fn baseline(&self) -> RegisterSet {
        RegisterSet::from_pairs(&[
            (0x01, 0x00),
            (0x02, 0x00),
            (0x03, 0x00),
            (0x04, 0x00),
            (0x05, 0x00),
            (0x06, 0x00),
            // pixel clock divider and LED drive strength
            (0x07, 0x21),
            (0x2a, 0x0f),
            (0x30, self.tuning.default_gain),
            (0x31, self.tuning.default_offset),
            (0x32, self.tuning.default_offset),
            (0x33, self.tuning.default_offset),
        ])
    }

    fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    fn table_capacity(&self) -> usize {
        512
    }

    fn physical_tables(&self) -> u8 {
        2
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
            _ => None,
        }
    }

    fn step_type_code(&self, step_type: StepType) -> Option<u8> {
        match step_type {
            StepType::Full => Some(0),
            StepType::Half => Some(1),
            StepType::Quarter => Some(2),
            StepType::Eighth => None,
        }
    }

    fn gain_curve(&self) -> GainCurve {
        GainCurve::Linear { step: 1.0 / 32.0 }
    }

    fn shares_gain(&self) -> bool {
        true
    }

    fn tuning(&self) -> &CalibrationTuning {
        &self.tuning
    }

    fn finish_program(&self, registers: &mut RegisterSet, ctx: &ProgramContext) {
        registers.set_flag(AFE_COLOR, ctx.channels == 3);
        registers.set_flag(LED_ALL_ON, ctx.led_add);

        // True gray lights every LED for the green on-time.
        if ctx.led_add {
            let green = registers.get_wide(self.layout.exposure[1]);
            for field in [self.layout.exposure[0], self.layout.exposure[2]] {
                if let Err(e) = registers.set_wide(field, green) {
                    tracing::warn!("Could not copy LED-add exposure: {e}");
                }
            }
        }
    }
}
