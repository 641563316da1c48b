//! Normalized scan request consumed by the planner.

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

pub const MM_PER_INCH: f64 = 25.4;

/// Scan area in millimetres relative to the scan origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanArea {
    pub x_offset: f64,
    pub y_offset: f64,
    pub width: f64,
    pub height: f64,
}

impl ScanArea {
    pub fn new(x_offset: f64, y_offset: f64, width: f64, height: f64) -> Self {
        Self {
            x_offset,
            y_offset,
            width,
            height,
        }
    }

    pub fn from_inches(x_offset: f64, y_offset: f64, width: f64, height: f64) -> Self {
        Self::new(
            x_offset * MM_PER_INCH,
            y_offset * MM_PER_INCH,
            width * MM_PER_INCH,
            height * MM_PER_INCH,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMode {
    Lineart,
    Gray,
    Color,
}

impl ColorMode {
    pub fn channels(self) -> u8 {
        match self {
            ColorMode::Color => 3,
            ColorMode::Lineart | ColorMode::Gray => 1,
        }
    }
}

/// Channel used for single-channel scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelFilter {
    /// No preference; true gray where the sensor supports it, green otherwise
    #[default]
    None,
    Red,
    Green,
    Blue,
}

impl ChannelFilter {
    /// Sensor channel index sampled for a single-channel scan.
    pub fn channel_index(self) -> u8 {
        match self {
            ChannelFilter::Red => 0,
            ChannelFilter::None | ChannelFilter::Green => 1,
            ChannelFilter::Blue => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanSource {
    #[default]
    Flatbed,
    /// Transparency adapter
    Transparency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFlags {
    pub disable_shading: bool,
    pub disable_lamp: bool,
    /// Acquire one line without moving the carriage
    pub single_line: bool,
    /// Move the carriage without acquiring data
    pub feeding_only: bool,
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub xres: u32,
    pub yres: u32,
    pub area: ScanArea,
    pub color_mode: ColorMode,
    pub depth: u8,
    pub filter: ChannelFilter,
    pub source: ScanSource,
    pub flags: ScanFlags,
}

impl ScanRequest {
    pub fn new(resolution: u32, area: ScanArea, color_mode: ColorMode, depth: u8) -> Self {
        Self {
            xres: resolution,
            yres: resolution,
            area,
            color_mode,
            depth,
            filter: ChannelFilter::None,
            source: ScanSource::Flatbed,
            flags: ScanFlags::default(),
        }
    }

    pub fn with_yres(mut self, yres: u32) -> Self {
        self.yres = yres;
        self
    }

    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_source(mut self, source: ScanSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_flags(mut self, flags: ScanFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn channels(&self) -> u8 {
        self.color_mode.channels()
    }

    /// Reject malformed requests before any planning.
    pub fn validate(&self) -> ScanResult<()> {
        if self.xres == 0 || self.yres == 0 {
            return Err(ScanError::InvalidParameter(format!(
                "resolution must be positive, got {}x{}",
                self.xres, self.yres
            )));
        }

        let area = &self.area;
        let finite = [area.x_offset, area.y_offset, area.width, area.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite || area.x_offset < 0.0 || area.y_offset < 0.0 {
            return Err(ScanError::InvalidParameter(format!(
                "scan area offset must be finite and non-negative: {area:?}"
            )));
        }

        // Feeding moves only need a length; single-line scans only need a width.
        let needs_width = !self.flags.feeding_only;
        let needs_height = !self.flags.single_line;
        if (needs_width && area.width <= 0.0) || (needs_height && area.height <= 0.0) {
            return Err(ScanError::InvalidParameter(format!(
                "degenerate scan area {:.2} x {:.2} mm",
                area.width, area.height
            )));
        }

        let depth_ok = match self.color_mode {
            ColorMode::Lineart => self.depth == 1,
            ColorMode::Gray | ColorMode::Color => matches!(self.depth, 8 | 16),
        };
        if !depth_ok {
            return Err(ScanError::InvalidParameter(format!(
                "depth {} not supported in {:?} mode",
                self.depth, self.color_mode
            )));
        }

        if self.flags.single_line && self.flags.feeding_only {
            return Err(ScanError::InvalidParameter(
                "single-line and feeding-only are exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn letter() -> ScanRequest {
        ScanRequest::new(
            300,
            ScanArea::from_inches(0.0, 0.0, 8.5, 11.0),
            ColorMode::Color,
            8,
        )
    }

    #[test]
    fn test_area_from_inches() {
        let area = ScanArea::from_inches(1.0, 0.5, 8.5, 11.0);
        assert_relative_eq!(area.x_offset, 25.4);
        assert_relative_eq!(area.width, 215.9);
        assert_relative_eq!(area.height, 279.4);
    }

    #[test]
    fn test_valid_request() {
        assert!(letter().validate().is_ok());
    }

    #[test]
    fn test_degenerate_requests_rejected() {
        let mut req = letter();
        req.area.width = 0.0;
        assert!(matches!(req.validate(), Err(ScanError::InvalidParameter(_))));

        let req = letter().with_yres(0);
        assert!(req.validate().is_err());

        let mut req = letter();
        req.depth = 1;
        assert!(req.validate().is_err());

        let mut req = letter();
        req.area.x_offset = -1.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_single_line_needs_no_height() {
        let mut req = letter().with_flags(ScanFlags {
            single_line: true,
            ..Default::default()
        });
        req.area.height = 0.0;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_filter_channel_index() {
        assert_eq!(ChannelFilter::None.channel_index(), 1);
        assert_eq!(ChannelFilter::Blue.channel_index(), 2);
    }
}
