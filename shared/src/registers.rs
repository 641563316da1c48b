//! Register set for register-programmable scanner ASICs.
//!
//! A [`RegisterSet`] is an address-ordered map of 8-bit register values. Wide
//! fields (resolution, pixel window, exposure, line count, feed length) span
//! several consecutive registers and are declared per field with their own
//! byte order, because the hardware is not uniform about it: some fields are
//! 24-bit MSB-first while others are 16-bit LSB-first.
//!
//! Fields are always written into the set as a whole, and the set is flushed
//! to the device as a single ordered group, so a multi-byte field is never
//! visible to the device in a torn state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device_interface::{DeviceInterface, DeviceResult};

/// Errors raised while encoding values into register fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Value does not fit in the declared field width.
    #[error("value {value} does not fit in {bits}-bit field at 0x{address:04x}")]
    Overflow { address: u16, value: u32, bits: u32 },

    /// Field declaration is unusable (zero or over-wide).
    #[error("invalid field declaration at 0x{address:04x}: {reason}")]
    InvalidField { address: u16, reason: &'static str },
}

/// Byte order of a multi-byte register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Most significant byte at the lowest address.
    MsbFirst,
    /// Least significant byte at the lowest address.
    LsbFirst,
}

impl ByteOrder {
    /// Encode a 16-bit word in this order.
    pub fn word_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::MsbFirst => value.to_be_bytes(),
            ByteOrder::LsbFirst => value.to_le_bytes(),
        }
    }
}

/// A field spanning `bytes` consecutive registers starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WideField {
    pub address: u16,
    pub bytes: u8,
    pub order: ByteOrder,
}

impl WideField {
    pub const fn narrow(address: u16) -> Self {
        Self {
            address,
            bytes: 1,
            order: ByteOrder::MsbFirst,
        }
    }

    pub const fn msb16(address: u16) -> Self {
        Self {
            address,
            bytes: 2,
            order: ByteOrder::MsbFirst,
        }
    }

    pub const fn lsb16(address: u16) -> Self {
        Self {
            address,
            bytes: 2,
            order: ByteOrder::LsbFirst,
        }
    }

    pub const fn msb24(address: u16) -> Self {
        Self {
            address,
            bytes: 3,
            order: ByteOrder::MsbFirst,
        }
    }

    pub const fn lsb24(address: u16) -> Self {
        Self {
            address,
            bytes: 3,
            order: ByteOrder::LsbFirst,
        }
    }

    /// Largest value representable by this field.
    pub fn max_value(&self) -> u32 {
        if self.bytes >= 4 {
            u32::MAX
        } else {
            (1u32 << (8 * u32::from(self.bytes))) - 1
        }
    }

    /// Register addresses covered by the field, lowest first.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        (0..u16::from(self.bytes)).map(move |i| self.address + i)
    }

    fn validate(&self) -> Result<(), RegisterError> {
        if self.bytes == 0 || self.bytes > 4 {
            return Err(RegisterError::InvalidField {
                address: self.address,
                reason: "wide fields span 1 to 4 registers",
            });
        }
        Ok(())
    }
}

/// A sub-byte field (flag or small code) inside a single register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    pub address: u16,
    pub shift: u8,
    pub width: u8,
}

impl BitField {
    /// Single-bit flag at bit `bit`.
    pub const fn flag(address: u16, bit: u8) -> Self {
        Self {
            address,
            shift: bit,
            width: 1,
        }
    }

    pub const fn code(address: u16, shift: u8, width: u8) -> Self {
        Self {
            address,
            shift,
            width,
        }
    }

    /// Mask of the field within its register.
    pub fn mask(&self) -> u8 {
        let bits = (1u16 << self.width) - 1;
        (bits << self.shift) as u8
    }

    fn validate(&self) -> Result<(), RegisterError> {
        if self.width == 0 || u16::from(self.shift) + u16::from(self.width) > 8 {
            return Err(RegisterError::InvalidField {
                address: self.address,
                reason: "bit fields must fit inside one register",
            });
        }
        Ok(())
    }
}

/// Ordered register address to value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    values: BTreeMap<u16, u8>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(address, value)` pairs; later pairs win.
    pub fn from_pairs(pairs: &[(u16, u8)]) -> Self {
        let mut set = Self::new();
        for &(address, value) in pairs {
            set.set(address, value);
        }
        set
    }

    pub fn set(&mut self, address: u16, value: u8) {
        self.values.insert(address, value);
    }

    /// Current value of a register, 0 if never written.
    pub fn get(&self, address: u16) -> u8 {
        self.values.get(&address).copied().unwrap_or(0)
    }

    pub fn contains(&self, address: u16) -> bool {
        self.values.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Store `value` into a wide field. Either every byte is written or none is.
    pub fn set_wide(&mut self, field: WideField, value: u32) -> Result<(), RegisterError> {
        field.validate()?;
        if value > field.max_value() {
            return Err(RegisterError::Overflow {
                address: field.address,
                value,
                bits: 8 * u32::from(field.bytes),
            });
        }

        let n = u32::from(field.bytes);
        for i in 0..n {
            let shift = match field.order {
                ByteOrder::MsbFirst => 8 * (n - 1 - i),
                ByteOrder::LsbFirst => 8 * i,
            };
            self.set(field.address + i as u16, (value >> shift) as u8);
        }
        Ok(())
    }

    /// Reassemble a wide field from its registers.
    pub fn get_wide(&self, field: WideField) -> u32 {
        let n = u32::from(field.bytes.min(4));
        (0..n).fold(0u32, |acc, i| {
            let byte = u32::from(self.get(field.address + i as u16));
            let shift = match field.order {
                ByteOrder::MsbFirst => 8 * (n - 1 - i),
                ByteOrder::LsbFirst => 8 * i,
            };
            acc | (byte << shift)
        })
    }

    /// Store a sub-byte code, leaving the other bits of the register untouched.
    pub fn set_bits(&mut self, field: BitField, value: u8) -> Result<(), RegisterError> {
        field.validate()?;
        if u16::from(value) >= (1u16 << field.width) {
            return Err(RegisterError::Overflow {
                address: field.address,
                value: u32::from(value),
                bits: u32::from(field.width),
            });
        }
        let mask = field.mask();
        let current = self.get(field.address);
        self.set(
            field.address,
            (current & !mask) | ((value << field.shift) & mask),
        );
        Ok(())
    }

    pub fn get_bits(&self, field: BitField) -> u8 {
        (self.get(field.address) & field.mask()) >> field.shift
    }

    /// Set or clear a flag. Wider fields get all their bits set or cleared.
    pub fn set_flag(&mut self, field: BitField, on: bool) {
        let mask = field.mask();
        let current = self.get(field.address);
        let value = if on { current | mask } else { current & !mask };
        self.set(field.address, value);
    }

    pub fn flag(&self, field: BitField) -> bool {
        self.get(field.address) & field.mask() != 0
    }

    /// Overlay every register of `other` onto this set.
    pub fn merge(&mut self, other: &RegisterSet) {
        for (&address, &value) in &other.values {
            self.values.insert(address, value);
        }
    }

    /// All registers in ascending address order.
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.values.iter().map(|(&a, &v)| (a, v)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.values.iter().map(|(&a, &v)| (a, v))
    }

    /// Write the whole set to the device as one address-ordered group.
    pub fn flush<D: DeviceInterface + ?Sized>(&self, device: &mut D) -> DeviceResult<()> {
        device.write_register_range(&self.writes())
    }
}

impl From<BTreeMap<u16, u8>> for RegisterSet {
    fn from(values: BTreeMap<u16, u8>) -> Self {
        Self { values }
    }
}
