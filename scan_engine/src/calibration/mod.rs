//! Calibration controller.
//!
//! Runs the stages `LedExposure -> Offset -> Gain -> Shading` against a
//! target session. Each stage is a small state machine in its own module
//! that decides the next trial values from the last measurement; this
//! module performs the diagnostic scans and moves between stages.

pub mod gain;
pub mod led;
pub mod offset;
pub mod shading;
pub mod types;

use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use shared::device_interface::DeviceInterface;
use tracing::{debug, info, warn};

use crate::error::{CalibrationWarning, ScanError, ScanResult, StageName};
use crate::executor::ScanExecutor;
use crate::session::ScanSession;
use gain::compute_gain;
use led::{LedAction, LedSearch};
use offset::{OffsetAction, OffsetSearch};
use shading::{pixel_means, ShadingAction, ShadingStage};
use types::{CalibrationValues, ShadingTable};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationStage {
    /// Not calibrating
    Idle,
    /// Searching per-channel exposure
    LedExposure,
    /// Bisecting AFE offset codes
    Offset,
    /// Computing AFE gain codes
    Gain,
    /// Building and uploading shading coefficients
    Shading,
    /// All stages finished; values are in effect
    Committed,
    /// A stage hit a device or configuration error
    Failed,
}

/// Outcome of a successful calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationReport {
    pub values: CalibrationValues,
    pub warnings: Vec<CalibrationWarning>,
    pub shading: Option<ShadingTable>,
}

pub struct CalibrationController {
    stage: CalibrationStage,
    values: CalibrationValues,
}

impl CalibrationController {
    /// Start from the values currently in effect.
    pub fn new(values: CalibrationValues) -> Self {
        Self {
            stage: CalibrationStage::Idle,
            values,
        }
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// Values committed by the last successful run.
    pub fn values(&self) -> &CalibrationValues {
        &self.values
    }

    fn enter(&mut self, stage: CalibrationStage) {
        info!("Calibration: {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    /// Calibrate for `target` and commit the values on success.
    ///
    /// Cancellation aborts and returns to `Idle`; device failures abort and
    /// end in `Failed`. Iteration caps never fail a run, they add a warning.
    pub fn run<D: DeviceInterface>(
        &mut self,
        exec: &mut ScanExecutor<D>,
        target: &ScanSession,
    ) -> ScanResult<CalibrationReport> {
        match self.run_stages(exec, target) {
            Ok(report) => {
                self.values = report.values.clone();
                self.enter(CalibrationStage::Committed);
                Ok(report)
            }
            Err(ScanError::Cancelled) => {
                exec.abort();
                self.enter(CalibrationStage::Idle);
                Err(ScanError::Cancelled)
            }
            Err(e) => {
                if e.is_device_failure() {
                    exec.abort();
                } else {
                    exec.release();
                }
                warn!("Calibration failed in {:?}: {e}", self.stage);
                self.enter(CalibrationStage::Failed);
                Err(e)
            }
        }
    }

    fn run_stages<D: DeviceInterface>(
        &mut self,
        exec: &mut ScanExecutor<D>,
        target: &ScanSession,
    ) -> ScanResult<CalibrationReport> {
        let tuning = exec.command_set().tuning().clone();
        let channels = target.sensor_channels();
        let mut values = self.values.clone();
        let mut warnings = Vec::new();

        if let Some(led_tuning) = tuning.led.clone() {
            exec.check_cancelled()?;
            self.enter(CalibrationStage::LedExposure);
            let session = target.reference(1, true, false);
            let start = values.exposure.unwrap_or(target.exposure);
            let mut search = LedSearch::new(led_tuning, &channels, start, target.line_period);
            loop {
                values.exposure = Some(search.exposure());
                let levels = measure(exec, &session, &values, &channels)?;
                debug!("LED exposure {:?} -> levels {:?}", search.exposure(), levels);
                if let LedAction::Done {
                    exposure,
                    converged,
                    iterations,
                } = search.step(&levels)
                {
                    values.exposure = Some(exposure);
                    if !converged {
                        degraded(&mut warnings, StageName::LedExposure, iterations);
                    }
                    break;
                }
            }
        }

        exec.check_cancelled()?;
        self.enter(CalibrationStage::Offset);
        let session = target.reference(1, false, false);
        let mut search = OffsetSearch::new(tuning.offset.clone(), &channels, values.offset);
        loop {
            values.offset = search.codes();
            let levels = measure(exec, &session, &values, &channels)?;
            debug!("Offset codes {:?} -> dark {:?}", values.offset, levels);
            if let OffsetAction::Done {
                offset,
                converged,
                passes,
            } = search.step(&levels)
            {
                values.offset = offset;
                if !converged {
                    degraded(&mut warnings, StageName::Offset, passes);
                }
                break;
            }
        }

        exec.check_cancelled()?;
        self.enter(CalibrationStage::Gain);
        let session = target.reference(1, true, false);
        let levels = measure(exec, &session, &values, &channels)?;
        let dark = f64::from(tuning.offset.dark_target);
        let cmd = exec.command_set();
        let outcome = compute_gain(
            &tuning.gain,
            cmd.gain_curve(),
            cmd.shares_gain(),
            &channels,
            values.gain,
            &levels,
            dark,
        );
        if outcome.clamped {
            warn!(
                "Gain codes {:?} clamped to [{}, {}]",
                outcome.gain, tuning.gain.min_code, tuning.gain.max_code
            );
        }
        debug!("Gain levels {:?} -> codes {:?}", levels, outcome.gain);
        values.gain = outcome.gain;

        let shading = if target.flags.shading {
            exec.check_cancelled()?;
            self.enter(CalibrationStage::Shading);
            let lines = tuning.shading.lines;
            let mut stage = ShadingStage::new(tuning.shading.clone(), &channels, target.window_start, dark);
            let table = loop {
                exec.check_cancelled()?;
                let lamp = stage.next_action() == ShadingAction::ScanWhite;
                let data = exec.run_diagnostic(&target.reference(lines, lamp, false), &values)?;
                if let ShadingAction::Done(table) = stage.step(&data)? {
                    break table;
                }
            };
            exec.upload_shading(&table)?;
            Some(table)
        } else {
            None
        };

        Ok(CalibrationReport {
            values,
            warnings,
            shading,
        })
    }
}

fn degraded(warnings: &mut Vec<CalibrationWarning>, stage: StageName, iterations: u32) {
    let warning = CalibrationWarning::Degraded { stage, iterations };
    warn!("{warning}; committing best value");
    warnings.push(warning);
}

/// Run one diagnostic scan and average each channel, indexed by sensor channel.
fn measure<D: DeviceInterface>(
    exec: &mut ScanExecutor<D>,
    session: &ScanSession,
    values: &CalibrationValues,
    channels: &[usize],
) -> ScanResult<[f64; 3]> {
    exec.check_cancelled()?;
    let data = exec.run_diagnostic(session, values)?;
    channel_levels(&data, channels)
}

/// Mean of every data channel, placed at its sensor channel index.
pub fn channel_levels(data: &Array3<u16>, channels: &[usize]) -> ScanResult<[f64; 3]> {
    let means = pixel_means(data)?
        .mean_axis(Axis(0))
        .ok_or_else(|| ScanError::InvalidParameter("diagnostic scan has no pixels".to_string()))?;
    let mut levels = [0.0; 3];
    for (c, &channel) in channels.iter().enumerate() {
        if let (Some(level), Some(slot)) = (means.get(c), levels.get_mut(channel)) {
            *slot = *level;
        }
    }
    Ok(levels)
}
