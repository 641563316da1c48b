//! Per-pixel shading coefficients from white and dark references.

use hardware::command_set::ShadingTuning;
use ndarray::{Array2, Array3, Axis};

use super::types::{ShadingRow, ShadingTable};
use crate::error::{ScanError, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadingAction {
    /// Lamp-on reference over `lines` lines
    ScanWhite,
    /// Lamp-off reference over `lines` lines
    ScanDark,
    Done(ShadingTable),
}

#[derive(Debug, Clone)]
pub struct ShadingStage {
    tuning: ShadingTuning,
    channels: Vec<usize>,
    window_start: u32,
    dark_level: f64,
    white: Option<Array2<f64>>,
}

impl ShadingStage {
    /// `channels` maps data channels to sensor channels; `dark_level` is
    /// used when the family takes no dark reference.
    pub fn new(tuning: ShadingTuning, channels: &[usize], window_start: u32, dark_level: f64) -> Self {
        Self {
            tuning,
            channels: channels.to_vec(),
            window_start,
            dark_level,
            white: None,
        }
    }

    pub fn next_action(&self) -> ShadingAction {
        if self.white.is_none() {
            ShadingAction::ScanWhite
        } else {
            ShadingAction::ScanDark
        }
    }

    /// Consume the reference scan requested by the previous action.
    pub fn step(&mut self, data: &Array3<u16>) -> ScanResult<ShadingAction> {
        let means = pixel_means(data)?;
        match self.white.take() {
            None if self.tuning.dark_scan => {
                self.white = Some(means);
                Ok(ShadingAction::ScanDark)
            }
            None => {
                let dark = Array2::from_elem(means.raw_dim(), self.dark_level);
                Ok(ShadingAction::Done(self.table(&means, &dark)))
            }
            Some(white) => {
                if white.raw_dim() != means.raw_dim() {
                    return Err(ScanError::InvalidParameter(format!(
                        "dark reference shape {:?} differs from white {:?}",
                        means.dim(),
                        white.dim()
                    )));
                }
                Ok(ShadingAction::Done(self.table(&white, &means)))
            }
        }
    }

    fn table(&self, white: &Array2<f64>, dark: &Array2<f64>) -> ShadingTable {
        let unity = f64::from(self.tuning.unity);
        let target = f64::from(self.tuning.target);
        let to_word = |v: f64| v.round().clamp(0.0, f64::from(u16::MAX)) as u16;

        let rows = self
            .channels
            .iter()
            .enumerate()
            .map(|(c, &channel)| {
                let white = white.column(c);
                let dark = dark.column(c);
                let coefficients = white
                    .iter()
                    .zip(dark.iter())
                    .map(|(&w, &d)| to_word(unity * target / (w - d).max(1.0)))
                    .collect();
                ShadingRow {
                    channel,
                    dark: dark.iter().map(|&d| to_word(d)).collect(),
                    coefficients,
                }
            })
            .collect();

        ShadingTable {
            window_start: self.window_start,
            rows,
        }
    }
}

/// Average over lines: pixels x channels.
pub fn pixel_means(data: &Array3<u16>) -> ScanResult<Array2<f64>> {
    data.mapv(f64::from)
        .mean_axis(Axis(0))
        .ok_or_else(|| ScanError::InvalidParameter("empty reference scan".to_string()))
}
