//! Scan session planning.
//!
//! Turns a [`ScanRequest`] into the derived geometry and timing of one scan:
//! native resolution, sensor window, output line size, line count including
//! color-skew lines, motor speed and feed distance. Planning is pure and
//! deterministic, so identical inputs always give identical sessions.

use hardware::descriptors::{MotorDescriptor, NativeMode, SensorDescriptor, StepType};
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};
use crate::request::{ChannelFilter, ColorMode, ScanRequest, ScanSource, MM_PER_INCH};

/// Optional behaviors a session switches on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    /// All LEDs lit for a true gray scan
    pub led_add: bool,
    /// Transparency adapter
    pub xpa: bool,
    pub shading: bool,
    pub lamp: bool,
    pub single_line: bool,
    pub feeding_only: bool,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSession {
    /// Hardware resolution the sensor is clocked at
    pub native_resolution: u32,
    /// Optical / native resolution
    pub optical_divisor: u32,
    /// Native / output resolution
    pub ratio: u32,
    pub xres: u32,
    pub yres: u32,
    pub channels: u8,
    pub depth: u8,
    /// Sensor channel sampled by single-channel scans
    pub channel_select: u8,
    /// Output pixels per line
    pub pixels_per_line: u32,
    /// Pixels per line at native resolution
    pub native_pixels: u32,
    /// Window on the full sensor at native resolution, black pixels included
    pub window_start: u32,
    pub window_end: u32,
    /// Window in register coordinates (per segment)
    pub pixel_start: u32,
    pub pixel_end: u32,
    /// Output bytes per line after alignment
    pub bytes_per_line: u32,
    /// Lines the caller asked for
    pub lines: u32,
    /// Lines the device produces, skew correction lines included
    pub hardware_lines: u32,
    /// Per-channel line delay for color skew correction
    pub color_shift: [u32; 3],
    /// Extra lines for odd/even pixel stagger
    pub stagger: u32,
    pub line_period: u32,
    pub exposure: [u16; 3],
    /// Motor interval while imaging, ticks per full step
    pub scan_speed_w: u32,
    pub step_type: StepType,
    /// Full steps from the origin to the first line
    pub feed_steps: u32,
    /// Full steps travelled while imaging
    pub move_steps: u32,
    /// Motor full steps per inch
    pub base_ydpi: u32,
    pub flags: SessionFlags,
    /// Window was clamped at the sensor edge
    pub inexact: bool,
}

impl ScanSession {
    /// Total image bytes the device returns.
    pub fn output_bytes(&self) -> usize {
        self.bytes_per_line as usize * self.hardware_lines as usize
    }

    /// Sensor channel index of each output channel.
    pub fn sensor_channels(&self) -> Vec<usize> {
        if self.channels == 3 {
            vec![0, 1, 2]
        } else {
            vec![usize::from(self.channel_select)]
        }
    }

    /// Calibration sub-session over the same sensor window.
    ///
    /// References keep the native mode, window and channel layout of the
    /// target but sample every native pixel at 16 bits, never shade, and
    /// start at the current carriage position.
    pub fn reference(&self, lines: u32, lamp: bool, motion: bool) -> ScanSession {
        let lines = lines.max(1);
        let mut session = self.clone();
        session.ratio = 1;
        session.xres = self.native_resolution;
        session.depth = 16;
        session.pixels_per_line = self.native_pixels;
        session.bytes_per_line = self.native_pixels * u32::from(self.channels) * 2;
        session.lines = lines;
        session.hardware_lines = lines;
        session.color_shift = [0; 3];
        session.stagger = 0;
        session.feed_steps = 0;
        session.move_steps = if motion {
            steps_for_lines(lines, self.yres, self.base_ydpi)
        } else {
            0
        };
        session.flags = SessionFlags {
            shading: false,
            lamp,
            single_line: !motion,
            feeding_only: false,
            reverse: false,
            ..self.flags
        };
        session.inexact = false;
        session
    }
}

/// Longest distance, in dots or steps, any geometry register can hold.
pub const MAX_DOTS: u32 = 0x00ff_ffff;

/// Dots covering `mm` at `dpi`, rejecting anything past [`MAX_DOTS`].
fn request_dots(what: &str, mm: f64, dpi: u32) -> ScanResult<u32> {
    let dots = (mm * f64::from(dpi) / MM_PER_INCH).round().max(0.0);
    if dots > f64::from(MAX_DOTS) {
        return Err(ScanError::InvalidParameter(format!(
            "scan {what} of {mm:.1} mm is beyond the scanner's range"
        )));
    }
    Ok(dots as u32)
}

fn bounded(what: &str, value: u64) -> ScanResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|&v| v <= MAX_DOTS)
        .ok_or_else(|| ScanError::InvalidParameter(format!("{what} of {value} is too long")))
}

fn steps_for_lines(lines: u32, yres: u32, base_ydpi: u32) -> u32 {
    let steps = u64::from(lines) * u64::from(base_ydpi);
    u32::try_from(steps.div_ceil(u64::from(yres.max(1)))).unwrap_or(u32::MAX)
}

/// Smallest native mode at or above `xres` that is an integer multiple of it.
fn select_native_mode(sensor: &SensorDescriptor, xres: u32) -> ScanResult<&NativeMode> {
    sensor
        .native_modes
        .iter()
        .filter(|m| m.resolution >= xres && m.resolution % xres == 0)
        .min_by_key(|m| m.resolution)
        .ok_or_else(|| {
            ScanError::InvalidParameter(format!(
                "no native mode of {} supports {xres} dpi",
                sensor.name
            ))
        })
}

/// Output bytes per line for a pixel count, rounded up to `alignment`.
pub fn line_bytes(pixels: u32, channels: u8, depth: u8, alignment: u32) -> u32 {
    let bits = u64::from(pixels) * u64::from(channels) * u64::from(depth);
    let bytes = bits.div_ceil(8);
    let alignment = u64::from(alignment.max(1));
    (bytes.div_ceil(alignment) * alignment) as u32
}

/// Plan a scan.
pub fn plan(
    request: &ScanRequest,
    sensor: &SensorDescriptor,
    motor: &MotorDescriptor,
) -> ScanResult<ScanSession> {
    request.validate()?;

    let mode = select_native_mode(sensor, request.xres)?;
    let native = mode.resolution;
    let ratio = native / request.xres;
    let divisor = sensor.divisor(native);

    let step_type = motor.step_type_for(request.yres).ok_or_else(|| {
        ScanError::InvalidParameter(format!(
            "motor has no step type for {} dpi",
            request.yres
        ))
    })?;

    if request.source == ScanSource::Transparency && !sensor.supports_xpa {
        return Err(ScanError::InvalidParameter(format!(
            "{} has no transparency adapter",
            sensor.name
        )));
    }

    let channels = request.channels();
    let feeding_only = request.flags.feeding_only;
    let single_line = request.flags.single_line;

    // Window at native resolution
    let sensor_pixels = sensor.pixel_count / divisor;
    let black = sensor.black_pixels / divisor;
    let mut start = request_dots("offset", request.area.x_offset, native)?;
    let mut output_pixels = if feeding_only {
        0
    } else {
        request_dots("width", request.area.width, request.xres)?
    };
    if !feeding_only && output_pixels == 0 {
        return Err(ScanError::InvalidParameter(
            "scan area is narrower than one pixel".to_string(),
        ));
    }
    if !feeding_only && start >= sensor_pixels {
        return Err(ScanError::InvalidParameter(format!(
            "scan area starts {start} pixels in, past the {sensor_pixels} pixel sensor"
        )));
    }

    let mut inexact = false;
    let requested_end = u64::from(start) + u64::from(output_pixels) * u64::from(ratio);
    if !feeding_only && requested_end > u64::from(sensor_pixels) {
        inexact = true;
        start = start.min(sensor_pixels.saturating_sub(ratio));
        output_pixels = (sensor_pixels - start) / ratio;
        if output_pixels == 0 {
            return Err(ScanError::InvalidParameter(
                "scan area lies outside the sensor".to_string(),
            ));
        }
        tracing::warn!(
            "Scan window clamped to sensor edge: {} pixels from {}",
            output_pixels,
            start
        );
    }
    let native_pixels = output_pixels * ratio;

    let window_start = if sensor.mirrored {
        black + sensor_pixels.saturating_sub(start + native_pixels)
    } else {
        black + start
    };
    let window_end = window_start + native_pixels;
    let segments = sensor.segment_count.max(1);
    let pixel_start = window_start / segments;
    let pixel_end = pixel_start + native_pixels.div_ceil(segments);

    let bytes_per_line = line_bytes(
        output_pixels,
        channels,
        request.depth,
        sensor.line_alignment,
    );

    let lines = if feeding_only {
        0
    } else if single_line {
        1
    } else {
        request_dots("height", request.area.height, request.yres)?
    };
    if !feeding_only && lines == 0 {
        return Err(ScanError::InvalidParameter(
            "scan area is shorter than one line".to_string(),
        ));
    }

    // Color rows and staggered pixels are physically apart; scan extra lines
    // so the assembler can realign them.
    let moving = !single_line && !feeding_only;
    let mut color_shift = [0u32; 3];
    if moving && channels == 3 && sensor.line_distance > 0 {
        let d = (sensor.line_distance * request.yres).div_ceil(motor.base_ydpi);
        color_shift = [0, d, 2 * d];
    }
    let stagger = if moving && sensor.stagger_lines > 0 && native == sensor.optical_resolution {
        (sensor.stagger_lines * request.yres).div_ceil(motor.base_ydpi)
    } else {
        0
    };
    let hardware_lines = bounded(
        "line count",
        u64::from(lines) + u64::from(color_shift[2]) + u64::from(stagger),
    )?;

    // Slow the line clock if the motor cannot keep up with it.
    let mut line_period = mode.line_period;
    let mut scan_speed_w = scan_speed(line_period, request.yres, motor.base_ydpi);
    let fastest = motor.scan_slope.max_speed_w;
    if moving && scan_speed_w < fastest {
        line_period = (u64::from(fastest) * u64::from(motor.base_ydpi))
            .div_ceil(u64::from(request.yres)) as u32;
        scan_speed_w = scan_speed(line_period, request.yres, motor.base_ydpi);
        tracing::debug!(
            "Line period raised from {} to {line_period} to match motor speed",
            mode.line_period
        );
    }

    let feed_mm = if feeding_only {
        request.area.y_offset + request.area.height
    } else {
        request.area.y_offset
    };
    let feed_steps = request_dots("feed", feed_mm, motor.base_ydpi)?;
    let move_steps = if moving {
        steps_for_lines(hardware_lines, request.yres, motor.base_ydpi)
    } else {
        0
    };
    bounded("carriage travel", u64::from(feed_steps) + u64::from(move_steps))?;

    let gray = request.color_mode != ColorMode::Color;
    let flags = SessionFlags {
        led_add: gray && request.filter == ChannelFilter::None && sensor.supports_led_add,
        xpa: request.source == ScanSource::Transparency,
        shading: !request.flags.disable_shading,
        lamp: !request.flags.disable_lamp,
        single_line,
        feeding_only,
        reverse: request.flags.reverse,
    };

    Ok(ScanSession {
        native_resolution: native,
        optical_divisor: divisor,
        ratio,
        xres: request.xres,
        yres: request.yres,
        channels,
        depth: request.depth,
        channel_select: if channels == 3 {
            0
        } else {
            request.filter.channel_index()
        },
        pixels_per_line: output_pixels,
        native_pixels,
        window_start,
        window_end,
        pixel_start,
        pixel_end,
        bytes_per_line,
        lines,
        hardware_lines,
        color_shift,
        stagger,
        line_period,
        exposure: mode.exposure,
        scan_speed_w,
        step_type,
        feed_steps,
        move_steps,
        base_ydpi: motor.base_ydpi,
        flags,
        inexact,
    })
}

fn scan_speed(line_period: u32, yres: u32, base_ydpi: u32) -> u32 {
    (u64::from(line_period) * u64::from(yres) / u64::from(base_ydpi.max(1))) as u32
}
