use hardware::command_set::{CalibrationTuning, CommandSet};
use serde::{Deserialize, Serialize};
use shared::registers::ByteOrder;

use crate::error::{ScanError, ScanResult};

/// AFE and exposure values a register program is built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationValues {
    /// Per-channel exposure; `None` uses the native mode default
    pub exposure: Option<[u16; 3]>,
    pub gain: [u8; 3],
    pub offset: [u8; 3],
}

impl CalibrationValues {
    /// Family defaults before any calibration ran.
    pub fn defaults(tuning: &CalibrationTuning) -> Self {
        Self {
            exposure: None,
            gain: [tuning.default_gain; 3],
            offset: [tuning.default_offset; 3],
        }
    }
}

/// Dark level and gain coefficient of every pixel of one sensor channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadingRow {
    pub channel: usize,
    pub dark: Vec<u16>,
    pub coefficients: Vec<u16>,
}

impl ShadingRow {
    /// `[dark, coefficient]` word pairs in device byte order.
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        self.dark
            .iter()
            .zip(&self.coefficients)
            .flat_map(|(&d, &c)| {
                let [d0, d1] = order.word_bytes(d);
                let [c0, c1] = order.word_bytes(c);
                [d0, d1, c0, c1]
            })
            .collect()
    }
}

/// Per-pixel shading correction for one sensor window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadingTable {
    /// First native pixel of the window on the full sensor
    pub window_start: u32,
    pub rows: Vec<ShadingRow>,
}

/// Bytes one pixel occupies in a shading bank.
const SHADING_ENTRY_BYTES: u32 = 4;

impl ShadingTable {
    pub fn pixels(&self) -> usize {
        self.rows.first().map_or(0, |r| r.coefficients.len())
    }

    /// Bank writes placing each row at its window offset.
    ///
    /// Every row is checked against the bank size before any data is
    /// returned, so an oversized table produces no partial upload.
    pub fn uploads(&self, cmd: &dyn CommandSet) -> ScanResult<Vec<(u32, Vec<u8>)>> {
        let offset = self.window_start * SHADING_ENTRY_BYTES;
        for row in &self.rows {
            let end = offset + row.coefficients.len() as u32 * SHADING_ENTRY_BYTES;
            if end > cmd.shading_bank_size() {
                return Err(ScanError::CapacityExceeded(format!(
                    "shading row for channel {} needs {end} bytes, bank holds {}",
                    row.channel,
                    cmd.shading_bank_size()
                )));
            }
        }

        let order = cmd.memory_order();
        Ok(self
            .rows
            .iter()
            .map(|row| (cmd.shading_bank(row.channel) + offset, row.to_bytes(order)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::cis::CisCommandSet;

    fn table(window_start: u32, pixels: usize) -> ShadingTable {
        ShadingTable {
            window_start,
            rows: (0..3)
                .map(|channel| ShadingRow {
                    channel,
                    dark: vec![0x0102; pixels],
                    coefficients: vec![0x2000; pixels],
                })
                .collect(),
        }
    }

    #[test]
    fn test_row_bytes_interleave_dark_and_coefficient() {
        let row = ShadingRow {
            channel: 0,
            dark: vec![0x0102],
            coefficients: vec![0x0304],
        };
        assert_eq!(row.to_bytes(ByteOrder::LsbFirst), vec![0x02, 0x01, 0x04, 0x03]);
        assert_eq!(row.to_bytes(ByteOrder::MsbFirst), vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_uploads_offset_by_window() {
        let cmd = CisCommandSet::new();
        let uploads = table(16, 100).uploads(&cmd).unwrap();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0].0, cmd.shading_bank(0) + 64);
        assert_eq!(uploads[2].0, cmd.shading_bank(2) + 64);
        assert_eq!(uploads[1].1.len(), 400);
    }

    #[test]
    fn test_oversized_table_rejected() {
        let cmd = CisCommandSet::new();
        let pixels = (cmd.shading_bank_size() / 4) as usize;
        assert!(table(0, pixels).uploads(&cmd).is_ok());
        assert!(matches!(
            table(1, pixels).uploads(&cmd),
            Err(ScanError::CapacityExceeded(_))
        ));
    }
}
