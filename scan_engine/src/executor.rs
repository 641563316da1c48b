//! Blocking device choreography.
//!
//! The executor owns the device handle and is the only place the engine
//! talks to it. It enforces a single active session, runs bounded status
//! waits that honor cancellation between polls, and performs the abort
//! sequence when a caller gives up on an operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hardware::command_set::CommandSet;
use hardware::descriptors::{MotorDescriptor, SensorDescriptor};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use shared::device_interface::{DeviceError, DeviceInterface, DeviceStatus};
use tracing::{debug, info, warn};

use crate::calibration::types::{CalibrationValues, ShadingTable};
use crate::error::{ScanError, ScanResult};
use crate::motor::{MotorProfile, ProfileCache, ProfileKind, RampLimits};
use crate::program::{self, ScanProgram};
use crate::request::ScanRequest;
use crate::session::{self, ScanSession};

/// Cooperative cancellation flag shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Poll cadence and upper bounds of status waits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub motion_timeout: Duration,
    pub lamp_timeout: Duration,
    pub home_timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            motion_timeout: Duration::from_secs(30),
            lamp_timeout: Duration::from_secs(15),
            home_timeout: Duration::from_secs(60),
        }
    }
}

pub struct ScanExecutor<D: DeviceInterface> {
    device: D,
    command_set: Box<dyn CommandSet>,
    sensor: SensorDescriptor,
    motor: MotorDescriptor,
    profiles: ProfileCache,
    active: Option<ScanSession>,
    cancel: CancelToken,
    wait: WaitSettings,
}

impl<D: DeviceInterface> ScanExecutor<D> {
    pub fn new(
        device: D,
        command_set: Box<dyn CommandSet>,
        sensor: SensorDescriptor,
        motor: MotorDescriptor,
    ) -> Self {
        Self {
            device,
            command_set,
            sensor,
            motor,
            profiles: ProfileCache::new(),
            active: None,
            cancel: CancelToken::new(),
            wait: WaitSettings::default(),
        }
    }

    pub fn with_wait_settings(mut self, wait: WaitSettings) -> Self {
        self.wait = wait;
        self
    }

    /// Share an externally created cancellation flag.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn command_set(&self) -> &dyn CommandSet {
        self.command_set.as_ref()
    }

    pub fn sensor(&self) -> &SensorDescriptor {
        &self.sensor
    }

    pub fn motor(&self) -> &MotorDescriptor {
        &self.motor
    }

    pub fn wait_settings(&self) -> &WaitSettings {
        &self.wait
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn active_session(&self) -> Option<&ScanSession> {
        self.active.as_ref()
    }

    pub fn check_cancelled(&self) -> ScanResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        Ok(())
    }

    fn ensure_idle_session(&self) -> ScanResult<()> {
        if self.active.is_some() {
            return Err(ScanError::SessionActive);
        }
        Ok(())
    }

    /// Plan a session; rejected while another session owns the device.
    pub fn plan(&self, request: &ScanRequest) -> ScanResult<ScanSession> {
        self.ensure_idle_session()?;
        session::plan(request, &self.sensor, &self.motor)
    }

    /// Scan and fast profiles for a session, reused across scans at one speed.
    pub fn profiles_for(
        &mut self,
        session: &ScanSession,
    ) -> ScanResult<(MotorProfile, Option<MotorProfile>)> {
        let limits = RampLimits::for_motor(&self.motor, self.command_set.table_capacity());
        let scan = self.profiles.get_or_generate(
            ProfileKind::Scan,
            &self.motor.scan_slope,
            session.scan_speed_w,
            session.step_type,
            &limits,
        )?;
        if scan.clipped {
            warn!(
                "Scan speed w={} not reachable, using w={}",
                scan.requested_speed_w, scan.terminal_speed_w
            );
        }
        let fast = if session.flags.single_line {
            None
        } else {
            Some(self.profiles.get_or_generate(
                ProfileKind::Fast,
                &self.motor.fast_slope,
                self.motor.fast_speed_w,
                self.motor.fast_step_type,
                &limits,
            )?)
        };
        Ok((scan, fast))
    }

    /// Build the register program for a session; rejected while a session is active.
    pub fn build(
        &mut self,
        session: &ScanSession,
        values: &CalibrationValues,
    ) -> ScanResult<ScanProgram> {
        self.ensure_idle_session()?;
        let (scan, fast) = self.profiles_for(session)?;
        program::build(
            session,
            &scan,
            fast.as_ref(),
            &self.sensor,
            values,
            self.command_set.as_ref(),
        )
    }

    /// Make `session` current, load its program and start motion.
    ///
    /// Registers go first as one group, then slope tables; motion only
    /// starts once every write succeeded.
    pub fn begin(&mut self, session: ScanSession, program: &ScanProgram) -> ScanResult<()> {
        self.ensure_idle_session()?;
        self.check_cancelled()?;
        let with_data = !session.flags.feeding_only;
        self.active = Some(session);

        program.registers.flush(&mut self.device)?;
        for upload in &program.slope_uploads {
            self.device.write_bulk(upload.bank, &upload.data)?;
        }
        self.check_cancelled()?;
        self.device.begin_motion(with_data)?;
        Ok(())
    }

    /// Poll until `done` holds, the timeout passes or cancellation is seen.
    pub fn wait_for(
        &mut self,
        what: &'static str,
        timeout: Duration,
        done: impl Fn(&DeviceStatus) -> bool,
    ) -> ScanResult<DeviceStatus> {
        let start = Instant::now();
        loop {
            self.check_cancelled()?;

            let status = self.device.poll_status()?;
            if done(&status) {
                return Ok(status);
            }

            if start.elapsed() > timeout {
                return Err(ScanError::Timeout {
                    what,
                    waited: start.elapsed(),
                });
            }

            thread::sleep(self.wait.poll_interval);
        }
    }

    pub fn wait_for_idle(&mut self) -> ScanResult<DeviceStatus> {
        let timeout = self.wait.motion_timeout;
        self.wait_for("motor idle", timeout, |s| !s.motor_moving)
    }

    pub fn wait_for_lamp(&mut self) -> ScanResult<DeviceStatus> {
        let timeout = self.wait.lamp_timeout;
        self.wait_for("lamp warm-up", timeout, |s| s.lamp_ready)
    }

    pub fn wait_for_home(&mut self) -> ScanResult<DeviceStatus> {
        let timeout = self.wait.home_timeout;
        self.wait_for("home sensor", timeout, |s| s.home_sensor && !s.motor_moving)
    }

    pub fn poll_status(&mut self) -> ScanResult<DeviceStatus> {
        Ok(self.device.poll_status()?)
    }

    /// Read exactly `n` image bytes.
    pub fn read_bytes(&mut self, n: usize) -> ScanResult<Vec<u8>> {
        self.check_cancelled()?;
        let data = self.device.read_image_bytes(n)?;
        if data.len() != n {
            return Err(ScanError::Io(DeviceError::Hardware(format!(
                "short image read: {} of {n} bytes",
                data.len()
            ))));
        }
        Ok(data)
    }

    /// Wait for the motion to end and release the session.
    pub fn finish(&mut self) -> ScanResult<()> {
        self.wait_for_idle()?;
        self.release();
        Ok(())
    }

    /// Stop motion, wait for the motor and release the session.
    pub fn end(&mut self) -> ScanResult<()> {
        let result = self
            .device
            .stop_motion()
            .map_err(ScanError::from)
            .and_then(|_| self.wait_for_idle().map(|_| ()));
        self.release();
        result
    }

    /// Forget the current session without touching the device.
    pub fn release(&mut self) -> Option<ScanSession> {
        self.active.take()
    }

    /// Abort sequence: stop the motor (best effort) and release the session.
    pub fn abort(&mut self) {
        info!("Aborting: stopping motor and releasing session");
        if let Err(e) = self.device.stop_motion() {
            warn!("Failed to stop motor during abort: {e}");
        }
        self.active = None;
    }

    /// Run one diagnostic scan and return its samples as lines x pixels x channels.
    pub fn run_diagnostic(
        &mut self,
        session: &ScanSession,
        values: &CalibrationValues,
    ) -> ScanResult<Array3<u16>> {
        let program = self.build(session, values)?;
        self.begin(session.clone(), &program)?;
        let data = self.read_bytes(session.output_bytes())?;
        self.finish()?;
        parse_samples(&data, session)
    }

    /// Upload shading coefficients into the family's shading banks.
    pub fn upload_shading(&mut self, table: &ShadingTable) -> ScanResult<()> {
        let uploads = table.uploads(self.command_set.as_ref())?;
        for (address, data) in uploads {
            self.check_cancelled()?;
            debug!("Shading upload: {} bytes at 0x{address:06x}", data.len());
            self.device.write_bulk(address, &data)?;
        }
        Ok(())
    }
}

/// Split raw image bytes into samples, scaling 8-bit data to 16 bits.
pub fn parse_samples(data: &[u8], session: &ScanSession) -> ScanResult<Array3<u16>> {
    let lines = session.hardware_lines as usize;
    let pixels = session.pixels_per_line as usize;
    let channels = usize::from(session.channels);
    let stride = session.bytes_per_line as usize;
    let bytes_per_sample = match session.depth {
        8 => 1,
        16 => 2,
        depth => {
            return Err(ScanError::InvalidParameter(format!(
                "cannot parse {depth}-bit samples"
            )))
        }
    };
    if data.len() < lines * stride || pixels * channels * bytes_per_sample > stride {
        return Err(ScanError::Io(DeviceError::Hardware(format!(
            "image buffer of {} bytes too short for {lines} lines of {stride}",
            data.len()
        ))));
    }

    let mut samples = Array3::<u16>::zeros((lines, pixels, channels));
    for ((line, px, c), sample) in samples.indexed_iter_mut() {
        let offset = line * stride + (px * channels + c) * bytes_per_sample;
        *sample = if bytes_per_sample == 2 {
            u16::from_le_bytes([data[offset], data[offset + 1]])
        } else {
            u16::from(data[offset]) << 8
        };
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ColorMode, ScanArea, ScanFlags};
    use hardware::models::cis_a4_600;
    use shared::device_interface::mock::{MockDevice, MockOp};

    fn executor(device: MockDevice) -> ScanExecutor<MockDevice> {
        let model = cis_a4_600();
        ScanExecutor::new(device, model.command_set(), model.sensor, model.motor)
            .with_wait_settings(WaitSettings {
                poll_interval: Duration::ZERO,
                motion_timeout: Duration::from_millis(200),
                lamp_timeout: Duration::from_millis(200),
                home_timeout: Duration::from_millis(200),
            })
    }

    fn small_request() -> ScanRequest {
        ScanRequest::new(
            300,
            ScanArea::from_inches(0.0, 0.0, 1.0, 0.1),
            ColorMode::Gray,
            16,
        )
    }

    fn defaults(exec: &ScanExecutor<MockDevice>) -> CalibrationValues {
        CalibrationValues::defaults(exec.command_set().tuning())
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_begin_writes_registers_then_tables_then_motion() {
        let mut exec = executor(MockDevice::new_constant(0));
        let session = exec.plan(&small_request()).unwrap();
        let program = exec.build(&session, &defaults(&exec)).unwrap();
        exec.begin(session, &program).unwrap();

        let device = exec.device();
        assert_eq!(device.register_groups().len(), 1);
        assert_eq!(device.bulk_writes().len(), program.slope_uploads.len());
        assert_eq!(device.calls(MockOp::BeginMotion), 1);
        assert!(exec.active_session().is_some());
    }

    #[test]
    fn test_second_session_rejected() {
        let mut exec = executor(MockDevice::new_constant(0));
        let session = exec.plan(&small_request()).unwrap();
        let program = exec.build(&session, &defaults(&exec)).unwrap();
        exec.begin(session.clone(), &program).unwrap();

        assert_eq!(exec.plan(&small_request()), Err(ScanError::SessionActive));
        assert_eq!(
            exec.build(&session, &defaults(&exec)),
            Err(ScanError::SessionActive)
        );

        exec.finish().unwrap();
        assert!(exec.plan(&small_request()).is_ok());
    }

    #[test]
    fn test_failed_upload_never_starts_motion() {
        let mut exec = executor(MockDevice::new_constant(0).fail_on(MockOp::WriteBulk, 1));
        let session = exec.plan(&small_request()).unwrap();
        let program = exec.build(&session, &defaults(&exec)).unwrap();

        let err = exec.begin(session, &program).unwrap_err();
        assert!(matches!(err, ScanError::Io(_)));
        assert_eq!(exec.device().calls(MockOp::BeginMotion), 0);

        exec.abort();
        assert_eq!(exec.device().calls(MockOp::StopMotion), 1);
        assert!(exec.active_session().is_none());
    }

    #[test]
    fn test_wait_times_out() {
        let mut exec = executor(MockDevice::new_constant(0).with_motion_polls(usize::MAX));
        exec.device_mut().begin_motion(false).unwrap();
        let err = exec.wait_for_idle().unwrap_err();
        assert!(matches!(err, ScanError::Timeout { what: "motor idle", .. }));
    }

    #[test]
    fn test_wait_observes_cancel() {
        let mut exec = executor(MockDevice::new_constant(0).with_motion_polls(usize::MAX));
        exec.device_mut().begin_motion(false).unwrap();
        exec.cancel_token().cancel();
        assert_eq!(exec.wait_for_idle().unwrap_err(), ScanError::Cancelled);
    }

    #[test]
    fn test_lamp_wait() {
        let mut exec = executor(MockDevice::new_constant(0).with_lamp_warmup(3));
        let status = exec.wait_for_lamp().unwrap();
        assert!(status.lamp_ready);
        assert_eq!(exec.device().calls(MockOp::PollStatus), 3);
    }

    #[test]
    fn test_diagnostic_parses_constant_data() {
        let mut exec = executor(MockDevice::new_constant(0x12));
        let request = small_request().with_flags(ScanFlags {
            single_line: true,
            ..Default::default()
        });
        let session = exec.plan(&request).unwrap();
        let data = exec.run_diagnostic(&session, &defaults(&exec)).unwrap();

        assert_eq!(data.dim(), (1, 300, 1));
        assert!(data.iter().all(|&s| s == 0x1212));
        assert!(exec.active_session().is_none());
        assert_eq!(exec.device().calls(MockOp::StopMotion), 0);
    }

    #[test]
    fn test_parse_eight_bit_color() {
        let model = cis_a4_600();
        let request = ScanRequest::new(
            300,
            ScanArea::new(0.0, 0.0, 25.4 * 2.0 / 300.0, 25.4 * 2.0 / 300.0),
            ColorMode::Color,
            8,
        );
        let session = session::plan(&request, &model.sensor, &model.motor).unwrap();
        assert_eq!(session.bytes_per_line, 6);
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let samples = parse_samples(&data, &session).unwrap();
        assert_eq!(samples[[0, 1, 2]], 6 << 8);
        assert_eq!(samples[[1, 0, 0]], 7 << 8);
        assert!(parse_samples(&data[..8], &session).is_err());
    }
}
