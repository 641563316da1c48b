//! Device abstraction layer for scanner control.
//!
//! Provides the narrow set of blocking operations the control engine needs from
//! a scanner ASIC: register access, bulk memory writes, a status snapshot and
//! motion control. Transports (USB, SCSI, network) implement this trait; tests
//! use [`mock::MockDevice`].

pub mod mock;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for device operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Transport-level failure while talking to the device
    #[error("transport error: {0}")]
    Transport(String),
    /// Device rejected or could not complete the request
    #[error("device error: {0}")]
    Hardware(String),
    /// Device is no longer reachable
    #[error("device disconnected")]
    Disconnected,
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Snapshot of the device status register, decoded into named facts.
///
/// The engine never assumes a particular bit encoding; transports translate
/// whatever their chip reports into these flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Motor is currently stepping
    pub motor_moving: bool,
    /// Feed-only motion has completed
    pub feed_finished: bool,
    /// Lamp (or LEDs) reached operating brightness
    pub lamp_ready: bool,
    /// Carriage sits on the home sensor
    pub home_sensor: bool,
    /// Image data is waiting in the device buffer
    pub data_available: bool,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flag = |on: bool, name: &'static str| if on { name } else { "-" };
        write!(
            f,
            "[{} {} {} {} {}]",
            flag(self.motor_moving, "MOVING"),
            flag(self.feed_finished, "FEEDEND"),
            flag(self.lamp_ready, "LAMP"),
            flag(self.home_sensor, "HOME"),
            flag(self.data_available, "DATA"),
        )
    }
}

/// Trait for scanner ASIC access
///
/// Every call blocks until the device has accepted the request. Register
/// widths and byte orders are the caller's concern; the interface only moves
/// bytes.
pub trait DeviceInterface: Send {
    /// Write a single 8-bit register
    fn write_register(&mut self, address: u16, value: u8) -> DeviceResult<()>;

    /// Read a single 8-bit register
    fn read_register(&mut self, address: u16) -> DeviceResult<u8>;

    /// Write an ordered group of registers
    ///
    /// Transports that support multi-register transfers should send the group
    /// in one command. The default issues single writes in the given order.
    fn write_register_range(&mut self, writes: &[(u16, u8)]) -> DeviceResult<()> {
        for &(address, value) in writes {
            self.write_register(address, value)?;
        }
        Ok(())
    }

    /// Write `data` into device memory starting at `bank_address`
    ///
    /// Used for slope tables and shading coefficients. Bank addresses come from
    /// the device family description.
    fn write_bulk(&mut self, bank_address: u32, data: &[u8]) -> DeviceResult<()>;

    /// Take a status snapshot
    fn poll_status(&mut self) -> DeviceResult<DeviceStatus>;

    /// Start the programmed motion, optionally acquiring image data
    fn begin_motion(&mut self, with_data: bool) -> DeviceResult<()>;

    /// Stop any motion in progress
    fn stop_motion(&mut self) -> DeviceResult<()>;

    /// Read `n` bytes of image data
    fn read_image_bytes(&mut self, n: usize) -> DeviceResult<Vec<u8>>;
}

impl DeviceInterface for Box<dyn DeviceInterface> {
    fn write_register(&mut self, address: u16, value: u8) -> DeviceResult<()> {
        (**self).write_register(address, value)
    }

    fn read_register(&mut self, address: u16) -> DeviceResult<u8> {
        (**self).read_register(address)
    }

    fn write_register_range(&mut self, writes: &[(u16, u8)]) -> DeviceResult<()> {
        (**self).write_register_range(writes)
    }

    fn write_bulk(&mut self, bank_address: u32, data: &[u8]) -> DeviceResult<()> {
        (**self).write_bulk(bank_address, data)
    }

    fn poll_status(&mut self) -> DeviceResult<DeviceStatus> {
        (**self).poll_status()
    }

    fn begin_motion(&mut self, with_data: bool) -> DeviceResult<()> {
        (**self).begin_motion(with_data)
    }

    fn stop_motion(&mut self) -> DeviceResult<()> {
        (**self).stop_motion()
    }

    fn read_image_bytes(&mut self, n: usize) -> DeviceResult<Vec<u8>> {
        (**self).read_image_bytes(n)
    }
}
