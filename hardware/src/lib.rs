//! Device-family knowledge for register-programmable scanner ASICs.
//!
//! Each family implements [`command_set::CommandSet`]; model presets pair a
//! family with the sensor and motor descriptors of a concrete scanner.

pub mod ccd;
pub mod cis;
pub mod command_set;
pub mod descriptors;
pub mod models;
pub mod sim;

pub use command_set::{CommandSet, GainCurve, ProgramContext, RegisterLayout, SlopeTableKind};
pub use descriptors::{MotorDescriptor, MotorSlope, SensorDescriptor, SensorKind, StepType};
