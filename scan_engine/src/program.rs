//! Register program building.
//!
//! Combines a planned session, its motor profiles and the current AFE values
//! into the register set and slope table uploads for one scan. Building is
//! pure: every limit is checked here so nothing half-valid reaches the
//! device.

use hardware::command_set::{CommandSet, ProgramContext, SlopeTableKind};
use hardware::descriptors::SensorDescriptor;
use shared::registers::RegisterSet;

use crate::calibration::types::CalibrationValues;
use crate::error::{ScanError, ScanResult};
use crate::motor::{compute_lead_in, phase_remainders, LeadIn, MotorProfile, PhaseRemainders};
use crate::session::ScanSession;

/// Full steps of cruise required before fast feeding pays off.
const FAST_FEED_MARGIN: u32 = 32;

/// One physical slope table write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlopeUpload {
    /// Logical tables pointing at this physical table
    pub tables: Vec<SlopeTableKind>,
    pub slot: u8,
    pub bank: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgram {
    pub registers: RegisterSet,
    pub slope_uploads: Vec<SlopeUpload>,
    pub lead_in: LeadIn,
    pub phase: PhaseRemainders,
    /// Feed uses the fast table before the scan ramp
    pub fast_fed: bool,
    /// Value written to the feed register
    pub feed: u32,
}

/// Physical slot of each logical table given the number of physical tables.
pub fn table_slots(physical_tables: u8) -> [u8; 5] {
    match physical_tables {
        0 | 1 => [0, 0, 0, 0, 0],
        2 | 3 => [0, 0, 0, 1, 1],
        _ => [0, 1, 2, 3, 3],
    }
}

fn check_capacity(profile: &MotorProfile, cmd: &dyn CommandSet) -> ScanResult<()> {
    if profile.step_count() > cmd.table_capacity() {
        return Err(ScanError::CapacityExceeded(format!(
            "{:?} profile has {} steps, {} tables hold {}",
            profile.kind,
            profile.step_count(),
            cmd.name(),
            cmd.table_capacity()
        )));
    }
    Ok(())
}

/// Build the register program for `session`.
pub fn build(
    session: &ScanSession,
    scan: &MotorProfile,
    fast: Option<&MotorProfile>,
    sensor: &SensorDescriptor,
    values: &CalibrationValues,
    cmd: &dyn CommandSet,
) -> ScanResult<ScanProgram> {
    check_capacity(scan, cmd)?;
    if let Some(fast) = fast {
        check_capacity(fast, cmd)?;
    }

    let sensor_end = (sensor.black_pixels + sensor.pixel_count) / session.optical_divisor.max(1);
    if session.window_end > sensor_end {
        return Err(ScanError::CapacityExceeded(format!(
            "window ends at pixel {} beyond sensor end {sensor_end}",
            session.window_end
        )));
    }

    let dpihw = cmd.dpihw_code(session.optical_divisor).ok_or_else(|| {
        ScanError::CapacityExceeded(format!(
            "{} cannot divide the sensor clock by {}",
            cmd.name(),
            session.optical_divisor
        ))
    })?;
    let scan_code = step_code(cmd, scan)?;
    let fast = if cmd.physical_tables() < 2 { None } else { fast };
    let fast_code = match fast {
        Some(profile) => step_code(cmd, profile)?,
        None => scan_code,
    };

    let layout = cmd.layout();
    let flags = &session.flags;
    let mut regs = cmd.baseline();

    regs.set_flag(layout.scan_enable, !flags.feeding_only);
    regs.set_flag(layout.motor_enable, !flags.single_line);
    regs.set_flag(layout.shading_enable, flags.shading);
    regs.set_flag(layout.lamp_enable, flags.lamp);
    regs.set_flag(layout.reverse, flags.reverse);
    if let Some(field) = layout.led_add {
        regs.set_flag(field, flags.led_add);
    }
    if let Some(field) = layout.xpa {
        regs.set_flag(field, flags.xpa);
    }

    regs.set_flag(layout.color, session.channels == 3);
    regs.set_flag(layout.depth16, session.depth == 16);
    regs.set_flag(layout.lineart, session.depth == 1);
    regs.set_bits(layout.channel_select, session.channel_select)?;
    regs.set_bits(layout.step_type, scan_code)?;
    regs.set_bits(layout.fast_step_type, fast_code)?;
    regs.set_bits(layout.vref, scan.vref.unwrap_or(0))?;
    regs.set_bits(layout.dpihw, dpihw)?;

    regs.set_wide(layout.dpiset, session.xres)?;
    regs.set_wide(layout.pixel_start, session.pixel_start)?;
    regs.set_wide(layout.pixel_end, session.pixel_end)?;
    regs.set_wide(layout.line_period, session.line_period)?;
    let exposure = values.exposure.unwrap_or(session.exposure);
    for (field, value) in layout.exposure.iter().zip(exposure) {
        let value = u32::from(value).clamp(1, session.line_period.max(1));
        regs.set_wide(*field, value)?;
    }
    regs.set_wide(layout.line_count, session.hardware_lines)?;
    regs.set_wide(layout.line_bytes, session.bytes_per_line)?;

    // Motion
    let lead_in = compute_lead_in(scan, session.feed_steps.saturating_add(session.move_steps));
    let scan_accel = lead_in.acceleration_steps.min(session.feed_steps);
    let (fast_fed, feed) = match fast {
        Some(fast) if !flags.single_line => {
            let fast_ramp = fast.ramp_full_steps();
            let needed = 2 * fast_ramp + scan_accel + FAST_FEED_MARGIN;
            if session.feed_steps > needed {
                (true, session.feed_steps - 2 * fast_ramp - scan_accel)
            } else {
                (false, session.feed_steps - scan_accel)
            }
        }
        _ => (false, session.feed_steps - scan_accel),
    };
    regs.set_flag(layout.fast_feed, fast_fed);
    regs.set_wide(layout.feed, feed)?;
    regs.set_wide(layout.scan_steps, scan.step_count() as u32)?;
    regs.set_wide(layout.decel_steps, lead_in.deceleration_steps)?;
    let fast_steps = fast.map_or(0, |p| p.step_count() as u32);
    regs.set_wide(layout.fast_steps, fast_steps)?;

    let phase = phase_remainders(scan, session.line_period)?;
    regs.set_wide(layout.z1, phase.z1)?;
    regs.set_wide(layout.z2, phase.z2)?;

    // Slope tables
    let slots = table_slots(cmd.physical_tables());
    for (kind, &slot) in SlopeTableKind::ALL.iter().zip(slots.iter()) {
        regs.set_bits(layout.table_index[kind.index()], slot)?;
    }
    let order = cmd.memory_order();
    let mut slope_uploads: Vec<SlopeUpload> = Vec::new();
    for (kind, &slot) in SlopeTableKind::ALL.iter().zip(slots.iter()) {
        if let Some(upload) = slope_uploads.iter_mut().find(|u| u.slot == slot) {
            upload.tables.push(*kind);
            continue;
        }
        let profile = match kind {
            SlopeTableKind::Fast | SlopeTableKind::Home => fast.unwrap_or(scan),
            _ => scan,
        };
        slope_uploads.push(SlopeUpload {
            tables: vec![*kind],
            slot,
            bank: cmd.slope_table_bank(slot),
            data: profile.to_bytes(order),
        });
    }

    // AFE
    for c in 0..3 {
        regs.set(layout.gain[c], values.gain[c]);
        regs.set(layout.offset[c], values.offset[c]);
    }

    let ctx = ProgramContext {
        native_divisor: session.optical_divisor,
        channels: session.channels,
        depth: session.depth,
        led_add: flags.led_add,
        xpa: flags.xpa,
        single_line: flags.single_line,
        feeding_only: flags.feeding_only,
    };
    cmd.finish_program(&mut regs, &ctx);

    tracing::debug!(
        "Built {} program: {} registers, {} slope uploads, feed {} (fast {})",
        cmd.name(),
        regs.len(),
        slope_uploads.len(),
        feed,
        fast_fed
    );

    Ok(ScanProgram {
        registers: regs,
        slope_uploads,
        lead_in,
        phase,
        fast_fed,
        feed,
    })
}

fn step_code(cmd: &dyn CommandSet, profile: &MotorProfile) -> ScanResult<u8> {
    cmd.step_type_code(profile.step_type).ok_or_else(|| {
        ScanError::CapacityExceeded(format!(
            "{} does not support {:?} stepping",
            cmd.name(),
            profile.step_type
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{generate_profile, ProfileKind, RampLimits};
    use crate::request::{ColorMode, ScanArea, ScanFlags, ScanRequest};
    use crate::session::plan;
    use hardware::models::{ccd_flatbed_1200, cis_a4_600, ModelPreset};

    struct Fixture {
        model: ModelPreset,
        cmd: Box<dyn CommandSet>,
        session: ScanSession,
        scan: MotorProfile,
        fast: MotorProfile,
    }

    fn fixture(model: ModelPreset, request: ScanRequest) -> Fixture {
        let cmd = model.command_set();
        let session = plan(&request, &model.sensor, &model.motor).unwrap();
        let limits = RampLimits::for_motor(&model.motor, cmd.table_capacity());
        let scan = generate_profile(
            ProfileKind::Scan,
            &model.motor.scan_slope,
            session.scan_speed_w,
            session.step_type,
            &limits,
        )
        .unwrap();
        let fast = generate_profile(
            ProfileKind::Fast,
            &model.motor.fast_slope,
            model.motor.fast_speed_w,
            model.motor.fast_step_type,
            &limits,
        )
        .unwrap();
        Fixture {
            model,
            cmd,
            session,
            scan,
            fast,
        }
    }

    fn build_fixture(f: &Fixture) -> ScanResult<ScanProgram> {
        let values = CalibrationValues::defaults(f.cmd.tuning());
        build(
            &f.session,
            &f.scan,
            Some(&f.fast),
            &f.model.sensor,
            &values,
            f.cmd.as_ref(),
        )
    }

    fn letter(resolution: u32) -> ScanRequest {
        ScanRequest::new(
            resolution,
            ScanArea::from_inches(0.0, 0.0, 8.5, 11.0),
            ColorMode::Color,
            8,
        )
    }

    #[test]
    fn test_letter_program_fields() {
        let f = fixture(cis_a4_600(), letter(300));
        let program = build_fixture(&f).unwrap();
        let regs = &program.registers;
        let layout = f.cmd.layout();

        assert_eq!(regs.get_wide(layout.dpiset), 300);
        assert_eq!(regs.get_wide(layout.line_count), 3300);
        assert_eq!(regs.get_wide(layout.line_bytes), 7650);
        assert_eq!(regs.get_wide(layout.pixel_start), 16);
        assert_eq!(regs.get_wide(layout.pixel_end), 16 + 2550);
        assert_eq!(regs.get_wide(layout.exposure[1]), 1800);
        assert!(regs.flag(layout.color));
        assert!(regs.flag(layout.scan_enable));
        assert!(regs.flag(layout.motor_enable));
        assert!(regs.flag(layout.lamp_enable));
        assert!(regs.flag(layout.shading_enable));
        assert!(!regs.flag(layout.depth16));
        assert_eq!(regs.get_wide(layout.scan_steps) as usize, f.scan.step_count());
        // AFE three-channel mode from the family finish
        assert_eq!(regs.get(0x04) & 0x01, 0x01);
    }

    #[test]
    fn test_line_count_msb24_bytes() {
        let request = ScanRequest::new(
            1200,
            ScanArea::from_inches(0.0, 0.0, 1.0, 60.0),
            ColorMode::Color,
            8,
        );
        let f = fixture(ccd_flatbed_1200(), request);
        let program = build_fixture(&f).unwrap();
        let regs = &program.registers;
        let lines = f.session.hardware_lines;
        assert!(lines > 0xffff);
        let reassembled = (u32::from(regs.get(0x28)) << 16)
            | (u32::from(regs.get(0x29)) << 8)
            | u32::from(regs.get(0x2a));
        assert_eq!(reassembled, lines);
    }

    #[test]
    fn test_capacity_checked_first() {
        let mut f = fixture(cis_a4_600(), letter(300));
        f.scan.table = vec![1200; 600];
        let err = build_fixture(&f).unwrap_err();
        assert!(matches!(err, ScanError::CapacityExceeded(_)));
    }

    #[test]
    fn test_two_table_mapping() {
        let f = fixture(cis_a4_600(), letter(300));
        let program = build_fixture(&f).unwrap();

        assert_eq!(program.slope_uploads.len(), 2);
        let scan = &program.slope_uploads[0];
        assert_eq!(
            scan.tables,
            vec![
                SlopeTableKind::Scan,
                SlopeTableKind::Backtrack,
                SlopeTableKind::Stop
            ]
        );
        assert_eq!(scan.bank, 0x2000);
        assert_eq!(scan.data.len(), f.scan.step_count() * 2);
        let fast = &program.slope_uploads[1];
        assert_eq!(fast.tables, vec![SlopeTableKind::Fast, SlopeTableKind::Home]);
        assert_eq!(fast.slot, 1);
        assert_eq!(fast.data.len(), f.fast.step_count() * 2);

        let layout = f.cmd.layout();
        let index = |k: SlopeTableKind| program.registers.get_bits(layout.table_index[k.index()]);
        assert_eq!(index(SlopeTableKind::Stop), 0);
        assert_eq!(index(SlopeTableKind::Home), 1);
    }

    #[test]
    fn test_four_table_mapping() {
        let f = fixture(ccd_flatbed_1200(), letter(300));
        let program = build_fixture(&f).unwrap();
        let slots: Vec<u8> = program.slope_uploads.iter().map(|u| u.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(
            program.slope_uploads[3].tables,
            vec![SlopeTableKind::Fast, SlopeTableKind::Home]
        );
        assert_eq!(program.slope_uploads[2].bank, 0x5000);
    }

    #[test]
    fn test_long_feed_uses_fast_table() {
        let request = ScanRequest::new(
            300,
            ScanArea::from_inches(0.0, 3.0, 2.0, 2.0),
            ColorMode::Gray,
            8,
        );
        let f = fixture(cis_a4_600(), request);
        let program = build_fixture(&f).unwrap();

        assert!(program.fast_fed);
        let expected = f.session.feed_steps
            - 2 * f.fast.ramp_full_steps()
            - program.lead_in.acceleration_steps;
        assert_eq!(program.feed, expected);
        assert!(program.registers.flag(f.cmd.layout().fast_feed));
        assert_eq!(
            program.registers.get_wide(f.cmd.layout().feed),
            expected
        );
    }

    #[test]
    fn test_short_feed_subtracts_scan_ramp() {
        let request = ScanRequest::new(
            300,
            ScanArea::new(0.0, 5.0, 20.0, 20.0),
            ColorMode::Gray,
            8,
        );
        let f = fixture(cis_a4_600(), request);
        let program = build_fixture(&f).unwrap();

        assert!(!program.fast_fed);
        let accel = program.lead_in.acceleration_steps.min(f.session.feed_steps);
        assert_eq!(program.feed, f.session.feed_steps - accel);
    }

    #[test]
    fn test_flags_follow_session() {
        let request = ScanRequest::new(
            300,
            ScanArea::from_inches(0.0, 0.0, 1.0, 1.0),
            ColorMode::Gray,
            8,
        )
        .with_flags(ScanFlags {
            disable_lamp: true,
            disable_shading: true,
            reverse: true,
            ..Default::default()
        });
        let f = fixture(cis_a4_600(), request);
        let program = build_fixture(&f).unwrap();
        let layout = f.cmd.layout();
        let regs = &program.registers;

        assert!(!regs.flag(layout.lamp_enable));
        assert!(!regs.flag(layout.shading_enable));
        assert!(regs.flag(layout.reverse));
        assert!(regs.flag(layout.led_add.unwrap()));
        assert_eq!(regs.get_bits(layout.channel_select), 1);
    }

    #[test]
    fn test_calibrated_values_used() {
        let f = fixture(ccd_flatbed_1200(), letter(300));
        let values = CalibrationValues {
            exposure: Some([1000, 2000, 60_000]),
            gain: [10, 20, 30],
            offset: [40, 50, 60],
        };
        let program = build(
            &f.session,
            &f.scan,
            Some(&f.fast),
            &f.model.sensor,
            &values,
            f.cmd.as_ref(),
        )
        .unwrap();
        let regs = &program.registers;
        let layout = f.cmd.layout();
        assert_eq!(regs.get_wide(layout.exposure[0]), 1000);
        // clamped to the line period
        assert_eq!(regs.get_wide(layout.exposure[2]), f.session.line_period);
        assert_eq!(regs.get(0x41), 20);
        assert_eq!(regs.get(0x46), 60);
    }

    #[test]
    fn test_single_line_program_holds_motor() {
        let request = letter(300).with_flags(ScanFlags {
            single_line: true,
            ..Default::default()
        });
        let f = fixture(cis_a4_600(), request);
        let program = build_fixture(&f).unwrap();
        assert!(!program.registers.flag(f.cmd.layout().motor_enable));
        assert!(!program.fast_fed);
        assert_eq!(program.feed, 0);
        assert_eq!(program.registers.get_wide(f.cmd.layout().line_count), 1);
    }
}
