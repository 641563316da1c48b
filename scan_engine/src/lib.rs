//! Control and calibration engine for register-programmable scanner ASICs.
//!
//! Planning flows one way: a [`request::ScanRequest`] becomes a
//! [`session::ScanSession`], motor ramps come from [`motor`], and
//! [`program`] packs everything into a register program. Calibration in
//! [`calibration`] runs short diagnostic scans through the
//! [`executor::ScanExecutor`] and feeds the measurements back into new
//! programs. [`driver::ScanDriver`] is the loop a frontend talks to.

pub mod calibration;
pub mod driver;
pub mod error;
pub mod executor;
pub mod motor;
pub mod program;
pub mod request;
pub mod session;

pub use error::{CalibrationWarning, ScanError, ScanResult};
