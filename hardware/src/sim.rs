//! Register-driven scanner simulator.
//!
//! [`SimulatedScanner`] plugs into `MockDevice` and renders image lines from
//! whatever register program is currently loaded: lamp state, exposure, AFE
//! gain and offset, color mode, sample depth and line length. Calibration
//! loops therefore see a device that responds to their adjustments.

use shared::device_interface::mock::DeviceModel;
use shared::registers::RegisterSet;

use crate::command_set::CommandSet;
use crate::models::ModelPreset;

/// Signal per exposure tick for red, green and blue at unity gain.
const DEFAULT_RESPONSE: [f64; 3] = [14.0, 18.0, 11.0];
/// Offset code at which the dark level leaves zero.
const OFFSET_ORIGIN: f64 = 40.0;
/// Dark level rise per offset code in 16-bit units.
const DARK_PER_CODE: f64 = 64.0;
/// Brightness loss at the window edges relative to the center.
const DEFAULT_FALLOFF: f64 = 0.2;

pub struct SimulatedScanner {
    command_set: Box<dyn CommandSet>,
    response: [f64; 3],
    falloff: f64,
    cursor: usize,
    last_program: Option<RegisterSet>,
}

impl SimulatedScanner {
    pub fn new(command_set: Box<dyn CommandSet>) -> Self {
        Self {
            command_set,
            response: DEFAULT_RESPONSE,
            falloff: DEFAULT_FALLOFF,
            cursor: 0,
            last_program: None,
        }
    }

    pub fn for_preset(preset: &ModelPreset) -> Self {
        Self::new(preset.command_set())
    }

    /// Override the per-channel signal per exposure tick.
    pub fn with_response(mut self, response: [f64; 3]) -> Self {
        self.response = response;
        self
    }

    /// Override the edge brightness loss (0 = perfectly flat illumination).
    pub fn with_falloff(mut self, falloff: f64) -> Self {
        self.falloff = falloff;
        self
    }

    /// Dark level produced by an offset code.
    pub fn dark_level(offset_code: u8) -> f64 {
        (f64::from(offset_code) - OFFSET_ORIGIN).max(0.0) * DARK_PER_CODE
    }

    fn render_line(&self, registers: &RegisterSet) -> Vec<u8> {
        let layout = self.command_set.layout();
        let curve = self.command_set.gain_curve();

        let line_bytes = registers.get_wide(layout.line_bytes) as usize;
        let color = registers.flag(layout.color);
        let wide = registers.flag(layout.depth16);
        let lamp = self.command_set.lamp_on(registers);
        let led_add = layout.led_add.is_some_and(|f| registers.flag(f));

        let channels: Vec<usize> = if color {
            vec![0, 1, 2]
        } else {
            vec![usize::from(registers.get_bits(layout.channel_select).min(2))]
        };
        let bytes_per_sample = if wide { 2 } else { 1 };
        let pixels = line_bytes / (channels.len() * bytes_per_sample);

        let mut line = vec![0u8; line_bytes];
        let mut pos = 0;
        for px in 0..pixels {
            let x = if pixels > 1 {
                2.0 * px as f64 / (pixels - 1) as f64 - 1.0
            } else {
                0.0
            };
            let vignette = 1.0 - self.falloff * x * x;

            for &c in &channels {
                let exposure = f64::from(registers.get_wide(layout.exposure[c]));
                let response = if led_add {
                    self.response.iter().sum::<f64>() / 3.0
                } else {
                    self.response[c]
                };
                let gain = curve.factor(registers.get(layout.gain[c]));
                let dark = Self::dark_level(registers.get(layout.offset[c]));
                let signal = if lamp {
                    exposure * response * vignette * gain
                } else {
                    0.0
                };
                let sample = (dark + signal).round().clamp(0.0, 65535.0) as u16;

                if wide {
                    line[pos..pos + 2].copy_from_slice(&sample.to_le_bytes());
                } else {
                    line[pos] = (sample >> 8) as u8;
                }
                pos += bytes_per_sample;
            }
        }
        line
    }
}

impl DeviceModel for SimulatedScanner {
    fn render(&mut self, registers: &RegisterSet, len: usize) -> Vec<u8> {
        if self.last_program.as_ref() != Some(registers) {
            self.cursor = 0;
            self.last_program = Some(registers.clone());
        }

        let line = self.render_line(registers);
        if line.is_empty() {
            return vec![0; len];
        }

        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let take = (line.len() - self.cursor).min(len - out.len());
            out.extend_from_slice(&line[self.cursor..self.cursor + take]);
            self.cursor = (self.cursor + take) % line.len();
        }
        out
    }

    fn at_home(&self, registers: &RegisterSet) -> bool {
        registers.flag(self.command_set.layout().reverse)
    }
}
