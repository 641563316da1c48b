//! Scan driver: the loop a frontend talks to.
//!
//! Wraps a [`ScanExecutor`] with the calibration values in effect, an
//! optional on-disk calibration cache and the scan lifecycle
//! (`start_scan`, `read_lines`, `end_scan`) plus carriage moves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hardware::models::ModelPreset;
use serde::{Deserialize, Serialize};
use shared::config_storage::ConfigStorage;
use shared::device_interface::DeviceInterface;
use tracing::{debug, info, warn};

use crate::calibration::types::{CalibrationValues, ShadingTable};
use crate::calibration::{CalibrationController, CalibrationReport, CalibrationStage};
use crate::error::{ScanError, ScanResult};
use crate::executor::{CancelToken, ScanExecutor, WaitSettings};
use crate::request::{ColorMode, ScanArea, ScanFlags, ScanRequest, MM_PER_INCH};
use crate::session::ScanSession;

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Upper bound for a motion to finish
    pub motion_timeout: Duration,
    /// Upper bound for the lamp to warm up
    pub lamp_timeout: Duration,
    /// Upper bound for a move home
    pub home_timeout: Duration,
    /// Cached calibrations older than this are ignored; `None` keeps them forever
    pub cache_expiration: Option<Duration>,
    /// Calibrate before every scan even when a cache entry matches
    pub force_calibration: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let wait = WaitSettings::default();
        Self {
            poll_interval: wait.poll_interval,
            motion_timeout: wait.motion_timeout,
            lamp_timeout: wait.lamp_timeout,
            home_timeout: wait.home_timeout,
            cache_expiration: Some(Duration::from_secs(60 * 60)),
            force_calibration: false,
        }
    }
}

impl DriverConfig {
    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            poll_interval: self.poll_interval,
            motion_timeout: self.motion_timeout,
            lamp_timeout: self.lamp_timeout,
            home_timeout: self.home_timeout,
        }
    }
}

/// Settings a cached calibration is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub native_resolution: u32,
    pub channels: u8,
    pub xpa: bool,
    pub window_start: u32,
    pub window_end: u32,
}

impl CacheKey {
    pub fn for_session(session: &ScanSession) -> Self {
        Self {
            native_resolution: session.native_resolution,
            channels: session.channels,
            xpa: session.flags.xpa,
            window_start: session.window_start,
            window_end: session.window_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub timestamp: DateTime<Utc>,
    pub values: CalibrationValues,
    pub shading: Option<ShadingTable>,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>, expiration: Option<Duration>) -> bool {
        match (expiration, (now - self.timestamp).to_std()) {
            (Some(limit), Ok(age)) => age <= limit,
            _ => true,
        }
    }
}

pub struct ScanDriver<D: DeviceInterface> {
    executor: ScanExecutor<D>,
    config: DriverConfig,
    storage: Option<ConfigStorage>,
    values: CalibrationValues,
    last_calibration: CalibrationStage,
    remaining_lines: u32,
}

impl<D: DeviceInterface> ScanDriver<D> {
    pub fn new(device: D, preset: &ModelPreset, config: DriverConfig) -> Self {
        let command_set = preset.command_set();
        let values = CalibrationValues::defaults(command_set.tuning());
        let executor = ScanExecutor::new(
            device,
            command_set,
            preset.sensor.clone(),
            preset.motor.clone(),
        )
        .with_wait_settings(config.wait_settings());
        Self {
            executor,
            config,
            storage: None,
            values,
            last_calibration: CalibrationStage::Idle,
            remaining_lines: 0,
        }
    }

    /// Persist calibrations under `storage`.
    pub fn with_storage(mut self, storage: ConfigStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share an externally created cancellation flag.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.executor = self.executor.with_cancel_token(cancel);
        self
    }

    pub fn executor(&self) -> &ScanExecutor<D> {
        &self.executor
    }

    pub fn device(&self) -> &D {
        self.executor.device()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Calibration values used for the next scan.
    pub fn values(&self) -> &CalibrationValues {
        &self.values
    }

    /// Final stage of the last calibration run.
    pub fn last_calibration(&self) -> CalibrationStage {
        self.last_calibration
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.executor.cancel_token()
    }

    pub fn active_session(&self) -> Option<&ScanSession> {
        self.executor.active_session()
    }

    pub fn remaining_lines(&self) -> u32 {
        self.remaining_lines
    }

    /// Abort after a device failure or cancellation, unless already cleaned up.
    fn cleanup_after(&mut self, err: &ScanError) {
        let fatal = err.is_device_failure() || *err == ScanError::Cancelled;
        if fatal && self.executor.active_session().is_some() {
            self.executor.abort();
        }
        if fatal {
            self.remaining_lines = 0;
        }
    }

    /// Lamp wait that runs the abort sequence on a fatal exit, so the motor
    /// is stopped exactly once even though no session is active yet.
    fn wait_for_lamp(&mut self) -> ScanResult<()> {
        if let Err(e) = self.executor.wait_for_lamp() {
            if e.is_device_failure() || e == ScanError::Cancelled {
                self.executor.abort();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Calibrate for `request` regardless of the cache and store the result.
    pub fn calibrate(&mut self, request: &ScanRequest) -> ScanResult<CalibrationReport> {
        self.executor.cancel_token().reset();
        let session = self.executor.plan(request)?;
        let result = self.run_calibration(&session);
        if let Err(e) = &result {
            self.cleanup_after(e);
        }
        result
    }

    fn run_calibration(&mut self, session: &ScanSession) -> ScanResult<CalibrationReport> {
        if session.flags.lamp {
            self.wait_for_lamp()?;
        }
        let mut controller = CalibrationController::new(self.values.clone());
        let result = controller.run(&mut self.executor, session);
        self.last_calibration = controller.stage();
        let report = result?;
        self.values = report.values.clone();
        self.store_cache(session, &report);
        Ok(report)
    }

    fn load_cache(&self) -> Vec<CacheEntry> {
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        match storage.get_calibration_cache(&self.executor.sensor().name) {
            None => Vec::new(),
            Some(Ok(entries)) => entries,
            Some(Err(e)) => {
                warn!("Ignoring unreadable calibration cache: {e}");
                Vec::new()
            }
        }
    }

    fn store_cache(&self, session: &ScanSession, report: &CalibrationReport) {
        let Some(storage) = &self.storage else {
            return;
        };
        let key = CacheKey::for_session(session);
        let mut entries = self.load_cache();
        entries.retain(|e| e.key != key);
        entries.push(CacheEntry {
            key,
            timestamp: Utc::now(),
            values: report.values.clone(),
            shading: report.shading.clone(),
        });
        match storage.save_calibration_cache(&self.executor.sensor().name, &entries) {
            Ok(path) => debug!("Calibration cache saved to {}", path.display()),
            Err(e) => warn!("Failed to save calibration cache: {e}"),
        }
    }

    /// Fresh cache entry usable for `session`.
    fn cached(&self, session: &ScanSession) -> Option<CacheEntry> {
        if self.config.force_calibration {
            return None;
        }
        let key = CacheKey::for_session(session);
        let now = Utc::now();
        self.load_cache().into_iter().find(|e| {
            e.key == key
                && e.is_fresh(now, self.config.cache_expiration)
                && (e.shading.is_some() || !session.flags.shading)
        })
    }

    fn ensure_calibrated(&mut self, session: &ScanSession) -> ScanResult<()> {
        if let Some(entry) = self.cached(session) {
            info!("Using cached calibration from {}", entry.timestamp);
            if let Some(table) = &entry.shading {
                self.executor.upload_shading(table)?;
            }
            self.values = entry.values;
            return Ok(());
        }
        self.run_calibration(session).map(|_| ())
    }

    /// Plan, calibrate if needed, program the device and start the scan.
    pub fn start_scan(&mut self, request: &ScanRequest) -> ScanResult<ScanSession> {
        self.executor.cancel_token().reset();
        let session = self.executor.plan(request)?;
        match self.start_session(&session) {
            Ok(()) => Ok(session),
            Err(e) => {
                self.cleanup_after(&e);
                Err(e)
            }
        }
    }

    fn start_session(&mut self, session: &ScanSession) -> ScanResult<()> {
        if session.flags.lamp {
            self.wait_for_lamp()?;
        }
        if session.flags.shading {
            self.ensure_calibrated(session)?;
        }
        let program = self.executor.build(session, &self.values)?;
        self.executor.begin(session.clone(), &program)?;
        self.remaining_lines = session.hardware_lines;
        info!(
            "Scan started: {}x{} dpi, {} lines of {} bytes",
            session.xres, session.yres, session.hardware_lines, session.bytes_per_line
        );
        Ok(())
    }

    /// Read up to `lines` raw lines of the running scan.
    pub fn read_lines(&mut self, lines: u32) -> ScanResult<Vec<u8>> {
        let bytes_per_line = match self.executor.active_session() {
            Some(session) if !session.flags.feeding_only => session.bytes_per_line,
            _ => {
                return Err(ScanError::InvalidParameter(
                    "no scan in progress".to_string(),
                ))
            }
        };
        let lines = lines.min(self.remaining_lines);
        if lines == 0 {
            return Ok(Vec::new());
        }

        match self.executor.read_bytes(lines as usize * bytes_per_line as usize) {
            Ok(data) => {
                self.remaining_lines -= lines;
                Ok(data)
            }
            Err(e) => {
                self.cleanup_after(&e);
                Err(e)
            }
        }
    }

    /// Stop the scan, wait for the motor and release the session.
    pub fn end_scan(&mut self) -> ScanResult<()> {
        self.remaining_lines = 0;
        if self.executor.active_session().is_none() {
            return Ok(());
        }
        self.executor.end()
    }

    /// Motor-only move of `distance_mm`.
    fn motion_request(&self, distance_mm: f64, reverse: bool) -> ScanRequest {
        let resolution = self
            .executor
            .sensor()
            .native_modes
            .first()
            .map_or(self.executor.motor().base_ydpi, |m| m.resolution);
        ScanRequest::new(
            resolution,
            ScanArea::new(0.0, 0.0, 0.0, distance_mm),
            ColorMode::Gray,
            8,
        )
        .with_flags(ScanFlags {
            disable_shading: true,
            disable_lamp: true,
            feeding_only: true,
            reverse,
            ..Default::default()
        })
    }

    fn run_move(&mut self, request: &ScanRequest, home: bool) -> ScanResult<()> {
        let session = self.executor.plan(request)?;
        let result = self.executor.build(&session, &self.values).and_then(|program| {
            self.executor.begin(session, &program)?;
            if home {
                self.executor.wait_for_home()?;
            } else {
                self.executor.wait_for_idle()?;
            }
            self.executor.release();
            Ok(())
        });
        if let Err(e) = &result {
            self.cleanup_after(e);
        }
        result
    }

    /// Return the carriage to the home sensor.
    pub fn move_home(&mut self) -> ScanResult<()> {
        self.executor.cancel_token().reset();
        if self.executor.poll_status()?.home_sensor {
            debug!("Carriage already home");
            return Ok(());
        }
        let motor = self.executor.motor();
        let travel_mm = f64::from(motor.home_travel) * MM_PER_INCH / f64::from(motor.base_ydpi.max(1));
        info!("Moving home, up to {travel_mm:.1} mm");
        let request = self.motion_request(travel_mm, true);
        self.run_move(&request, true)
    }

    /// Move the carriage forward by `distance_mm` without scanning.
    pub fn feed(&mut self, distance_mm: f64) -> ScanResult<()> {
        self.executor.cancel_token().reset();
        info!("Feeding {distance_mm:.1} mm");
        let request = self.motion_request(distance_mm, false);
        self.run_move(&request, false)
    }
}
