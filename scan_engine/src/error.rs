use std::fmt;
use std::time::Duration;

use shared::device_interface::DeviceError;
use shared::registers::RegisterError;
use thiserror::Error;

/// Errors raised by the scan engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Malformed or out-of-range request
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Profile or register program exceeds device limits
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Device interface call failed
    #[error("device I/O failed: {0}")]
    Io(#[from] DeviceError),

    /// Status wait exceeded its bound
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    /// Cooperative cancellation observed
    #[error("operation cancelled")]
    Cancelled,

    /// A session already owns the device
    #[error("a scan session is already active")]
    SessionActive,
}

impl From<RegisterError> for ScanError {
    fn from(e: RegisterError) -> Self {
        ScanError::CapacityExceeded(e.to_string())
    }
}

impl ScanError {
    /// Errors that come from the device rather than the caller.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, ScanError::Io(_) | ScanError::Timeout { .. })
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

/// Calibration stage names used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StageName {
    LedExposure,
    Offset,
    Gain,
    Shading,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StageName::LedExposure => "LED exposure",
            StageName::Offset => "offset",
            StageName::Gain => "gain",
            StageName::Shading => "shading",
        };
        f.write_str(name)
    }
}

/// Non-fatal conditions carried beside a successful calibration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CalibrationWarning {
    /// Iteration cap reached; best value so far was committed
    Degraded { stage: StageName, iterations: u32 },
}

impl fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CalibrationWarning::Degraded { stage, iterations } => write!(
                f,
                "{stage} calibration did not converge after {iterations} iterations"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_overflow_is_capacity() {
        let err: ScanError = RegisterError::Overflow {
            address: 0x10,
            value: 70_000,
            bits: 16,
        }
        .into();
        assert!(matches!(err, ScanError::CapacityExceeded(_)));
        assert!(!err.is_device_failure());
    }

    #[test]
    fn test_device_error_is_io() {
        let err: ScanError = DeviceError::Disconnected.into();
        assert!(err.is_device_failure());
        assert_eq!(err.to_string(), "device I/O failed: device disconnected");
    }

    #[test]
    fn test_warning_display() {
        let warning = CalibrationWarning::Degraded {
            stage: StageName::LedExposure,
            iterations: 100,
        };
        assert_eq!(
            warning.to_string(),
            "LED exposure calibration did not converge after 100 iterations"
        );
    }
}
