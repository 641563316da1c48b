//! Shared components for the scanner control workspace.
//!
//! This crate contains the types used across the hardware descriptions and
//! the control engine: the register set, the device interface boundary (with
//! a recording mock), and on-disk configuration storage.

pub mod config_storage;
pub mod device_interface;
pub mod registers;
