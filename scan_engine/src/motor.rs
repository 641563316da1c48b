//! Motor profile generation.
//!
//! A profile is a slope table: the sequence of inter-step intervals the ASIC
//! plays back to accelerate the carriage from standstill to a cruise speed.
//! Intervals ("w") are timer ticks per step, so the table decreases toward
//! the target. Generation is pure computation; nothing here touches the
//! device.

use std::collections::HashMap;

use hardware::descriptors::{MotorDescriptor, MotorSlope, StepType};
use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// Purpose of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileKind {
    /// Imaging motion; ends exactly on the target interval and is padded
    Scan,
    /// Non-data motion; shortest ramp, no padding
    Fast,
}

/// Table constraints for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampLimits {
    /// Acceleration budget in table entries
    pub max_ramp_steps: u32,
    /// Hardware slope table capacity in entries
    pub capacity: usize,
    /// Scan tables are padded to a multiple of this
    pub alignment: u32,
    /// Minimum scan table length
    pub min_size: u32,
    /// Full-step intervals selecting the velocity reference code
    pub vref_thresholds: Vec<u32>,
}

impl RampLimits {
    pub fn for_motor(motor: &MotorDescriptor, capacity: usize) -> Self {
        Self {
            max_ramp_steps: motor.acceleration_budget,
            capacity,
            alignment: motor.table_alignment,
            min_size: motor.min_table_size,
            vref_thresholds: motor.vref_thresholds.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorProfile {
    pub kind: ProfileKind,
    pub step_type: StepType,
    /// Intervals per microstep, ready for upload
    pub table: Vec<u16>,
    /// Entries up to and including the first one at terminal speed
    pub ramp_steps: usize,
    /// Full-step interval actually reached
    pub terminal_speed_w: u32,
    /// Full-step interval that was asked for
    pub requested_speed_w: u32,
    /// Target could not be reached exactly
    pub clipped: bool,
    pub vref: Option<u8>,
}

impl MotorProfile {
    pub fn step_count(&self) -> usize {
        self.table.len()
    }

    /// Timer ticks spent on the acceleration ramp.
    pub fn ramp_time(&self) -> u64 {
        self.table[..self.ramp_steps]
            .iter()
            .map(|&w| u64::from(w))
            .sum()
    }

    /// Acceleration length in full steps.
    pub fn ramp_full_steps(&self) -> u32 {
        let microsteps = self.step_type.microsteps() as usize;
        self.ramp_steps.div_ceil(microsteps) as u32
    }

    /// Table encoded as 16-bit words in device byte order.
    pub fn to_bytes(&self, order: shared::registers::ByteOrder) -> Vec<u8> {
        self.table
            .iter()
            .flat_map(|&w| order.word_bytes(w))
            .collect()
    }
}

/// Interval of the `n`th step (1-based) along a slope.
fn slope_interval(slope: &MotorSlope, n: u32) -> f64 {
    let base = f64::from(slope.base_speed_w);
    if n <= 2 {
        return base;
    }
    let v0 = 1.0 / base;
    let v = (v0 * v0 + 2.0 * slope.acceleration * f64::from(n - 1)).sqrt();
    1.0 / v
}

fn to_table_word(w: u32, step_type: StepType) -> ScanResult<u16> {
    u16::try_from(w >> step_type.shift()).map_err(|_| {
        ScanError::CapacityExceeded(format!(
            "interval {w} does not fit a slope table word at {step_type:?} stepping"
        ))
    })
}

/// Velocity reference code: how many thresholds the interval is below.
pub fn vref_code(terminal_speed_w: u32, thresholds: &[u32]) -> Option<u8> {
    if thresholds.is_empty() {
        return None;
    }
    Some(thresholds.iter().filter(|&&t| terminal_speed_w < t).count() as u8)
}

/// Build a ramp toward `target_speed_w` (ticks per full step).
///
/// A target faster than the slope allows is raised to the slope maximum, and
/// a ramp that would not fit the budget or table is cut short; both cases
/// return a best-effort profile with `clipped` set.
pub fn generate_profile(
    kind: ProfileKind,
    slope: &MotorSlope,
    target_speed_w: u32,
    step_type: StepType,
    limits: &RampLimits,
) -> ScanResult<MotorProfile> {
    if target_speed_w == 0 || slope.base_speed_w == 0 {
        return Err(ScanError::InvalidParameter(format!(
            "motor speeds must be positive (target {target_speed_w}, base {})",
            slope.base_speed_w
        )));
    }
    if limits.max_ramp_steps == 0 || limits.capacity == 0 {
        return Err(ScanError::InvalidParameter(
            "acceleration budget and table capacity must be positive".to_string(),
        ));
    }
    if !slope.acceleration.is_finite() || slope.acceleration < 0.0 {
        return Err(ScanError::InvalidParameter(format!(
            "invalid slope acceleration {}",
            slope.acceleration
        )));
    }

    let mut clipped = false;
    let mut target = target_speed_w;
    if target < slope.max_speed_w {
        target = slope.max_speed_w;
        clipped = true;
    }

    let limit = (limits.max_ramp_steps as usize).min(limits.capacity);
    let mut ramp: Vec<u32> = Vec::new();
    let mut reached = false;
    let mut n = 1;
    while ramp.len() < limit {
        let w = slope_interval(slope, n);
        if w <= f64::from(target) {
            ramp.push(target);
            reached = true;
            break;
        }
        ramp.push((w.round() as u32).max(target));
        n += 1;
    }
    if !reached {
        clipped = true;
    }

    // ramp is never empty: limit >= 1
    let terminal = ramp.last().copied().unwrap_or(target);
    let ramp_steps = ramp.len();

    let mut table = ramp
        .iter()
        .map(|&w| to_table_word(w, step_type))
        .collect::<ScanResult<Vec<u16>>>()?;

    if kind == ProfileKind::Scan {
        let alignment = limits.alignment.max(1) as usize;
        let wanted = table.len().max(limits.min_size as usize);
        let padded = wanted.div_ceil(alignment) * alignment;
        let padded = padded.min(limits.capacity);
        let fill = to_table_word(terminal, step_type)?;
        table.resize(padded.max(table.len()), fill);
    }

    if clipped {
        tracing::debug!(
            "{kind:?} profile clipped: requested w={target_speed_w}, reached w={terminal}"
        );
    }

    Ok(MotorProfile {
        kind,
        step_type,
        table,
        ramp_steps,
        terminal_speed_w: terminal,
        requested_speed_w: target_speed_w,
        clipped,
        vref: vref_code(terminal, &limits.vref_thresholds),
    })
}

/// Steps reserved at the start and end of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadIn {
    pub acceleration_steps: u32,
    pub deceleration_steps: u32,
}

impl LeadIn {
    /// Full steps left at cruise speed.
    pub fn cruise_steps(&self, total_distance: u32) -> u32 {
        total_distance.saturating_sub(self.acceleration_steps + self.deceleration_steps)
    }
}

/// Full steps needed to ramp up and down within a move of `total_distance`.
///
/// Moves too short for both ramps are split between them, acceleration
/// taking the larger half.
pub fn compute_lead_in(profile: &MotorProfile, total_distance: u32) -> LeadIn {
    let ramp = profile.ramp_full_steps();
    if ramp.saturating_mul(2) <= total_distance {
        LeadIn {
            acceleration_steps: ramp,
            deceleration_steps: ramp,
        }
    } else {
        LeadIn {
            acceleration_steps: total_distance.div_ceil(2),
            deceleration_steps: total_distance / 2,
        }
    }
}

/// Phase of the ramp time against the sensor line period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRemainders {
    /// Phase when cruise speed is reached
    pub z1: u32,
    /// Phase after a backtrack (down and up the ramp again)
    pub z2: u32,
}

pub fn phase_remainders(profile: &MotorProfile, line_period: u32) -> ScanResult<PhaseRemainders> {
    if line_period == 0 {
        return Err(ScanError::InvalidParameter(
            "line period must be positive".to_string(),
        ));
    }
    let period = u64::from(line_period);
    let ramp = profile.ramp_time();
    Ok(PhaseRemainders {
        z1: (ramp % period) as u32,
        z2: ((ramp * 2) % period) as u32,
    })
}

/// Profiles keyed by purpose, speed and step type, reused across scans.
#[derive(Debug, Default)]
pub struct ProfileCache {
    profiles: HashMap<(ProfileKind, u32, StepType), MotorProfile>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_generate(
        &mut self,
        kind: ProfileKind,
        slope: &MotorSlope,
        target_speed_w: u32,
        step_type: StepType,
        limits: &RampLimits,
    ) -> ScanResult<MotorProfile> {
        let key = (kind, target_speed_w, step_type);
        if let Some(profile) = self.profiles.get(&key) {
            return Ok(profile.clone());
        }
        let profile = generate_profile(kind, slope, target_speed_w, step_type, limits)?;
        self.profiles.insert(key, profile.clone());
        Ok(profile)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
