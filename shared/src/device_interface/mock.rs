use super::{DeviceError, DeviceInterface, DeviceResult, DeviceStatus};
use crate::registers::RegisterSet;
use std::collections::HashMap;

/// Behavior plugged into [`MockDevice`] to produce image data and sensor facts
/// from the currently programmed registers.
pub trait DeviceModel: Send {
    /// Produce `len` bytes of image data for the current register state.
    fn render(&mut self, registers: &RegisterSet, len: usize) -> Vec<u8>;

    /// Whether the carriage rests on the home sensor after a motion ends.
    fn at_home(&self, _registers: &RegisterSet) -> bool {
        false
    }
}

/// Model that returns a constant byte for every image byte.
pub struct ConstantModel {
    pub value: u8,
}

impl DeviceModel for ConstantModel {
    fn render(&mut self, _registers: &RegisterSet, len: usize) -> Vec<u8> {
        vec![self.value; len]
    }
}

/// Operations tracked by the mock for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    WriteRegister,
    ReadRegister,
    WriteRange,
    WriteBulk,
    PollStatus,
    BeginMotion,
    StopMotion,
    ReadImage,
}

pub struct MockDevice {
    registers: RegisterSet,
    groups: Vec<Vec<(u16, u8)>>,
    bulk: Vec<(u32, Vec<u8>)>,
    model: Box<dyn DeviceModel>,
    moving: bool,
    acquiring: bool,
    polls_until_idle: usize,
    motion_polls: usize,
    feed_finished: bool,
    home: bool,
    lamp_warmup_polls: usize,
    bytes_read: usize,
    calls: HashMap<MockOp, usize>,
    failures: Vec<(MockOp, usize)>,
    read_hook: Option<Box<dyn FnMut(usize) + Send>>,
}

impl MockDevice {
    pub fn new(model: Box<dyn DeviceModel>) -> Self {
        Self {
            registers: RegisterSet::new(),
            groups: Vec::new(),
            bulk: Vec::new(),
            model,
            moving: false,
            acquiring: false,
            polls_until_idle: 0,
            motion_polls: 1,
            feed_finished: false,
            home: true,
            lamp_warmup_polls: 0,
            bytes_read: 0,
            calls: HashMap::new(),
            failures: Vec::new(),
            read_hook: None,
        }
    }

    pub fn new_constant(value: u8) -> Self {
        Self::new(Box::new(ConstantModel { value }))
    }

    /// Number of status polls a motion reports as moving before it ends.
    pub fn with_motion_polls(mut self, polls: usize) -> Self {
        self.motion_polls = polls.max(1);
        self
    }

    /// Number of status polls reporting the lamp as not yet ready.
    pub fn with_lamp_warmup(mut self, polls: usize) -> Self {
        self.lamp_warmup_polls = polls;
        self
    }

    /// Fail the `nth` (1-based) call of `op` with a transport error.
    pub fn fail_on(mut self, op: MockOp, nth: usize) -> Self {
        self.failures.push((op, nth));
        self
    }

    /// Install a hook invoked with the running count of image reads.
    pub fn on_image_read(mut self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        self.read_hook = Some(Box::new(hook));
        self
    }

    pub fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    /// Register groups in the order they were written.
    pub fn register_groups(&self) -> &[Vec<(u16, u8)>] {
        &self.groups
    }

    /// Bulk writes as `(bank_address, data)` in the order they were written.
    pub fn bulk_writes(&self) -> &[(u32, Vec<u8>)] {
        &self.bulk
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.calls.get(&op).copied().unwrap_or(0)
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    fn tick(&mut self, op: MockOp) -> DeviceResult<()> {
        let count = self.calls.entry(op).or_insert(0);
        *count += 1;
        let count = *count;
        if self.failures.iter().any(|&(o, n)| o == op && n == count) {
            return Err(DeviceError::Transport(format!(
                "injected failure on {op:?} call {count}"
            )));
        }
        Ok(())
    }
}

impl DeviceInterface for MockDevice {
    fn write_register(&mut self, address: u16, value: u8) -> DeviceResult<()> {
        self.tick(MockOp::WriteRegister)?;
        self.registers.set(address, value);
        self.groups.push(vec![(address, value)]);
        Ok(())
    }

    fn read_register(&mut self, address: u16) -> DeviceResult<u8> {
        self.tick(MockOp::ReadRegister)?;
        Ok(self.registers.get(address))
    }

    fn write_register_range(&mut self, writes: &[(u16, u8)]) -> DeviceResult<()> {
        self.tick(MockOp::WriteRange)?;
        for &(address, value) in writes {
            self.registers.set(address, value);
        }
        self.groups.push(writes.to_vec());
        Ok(())
    }

    fn write_bulk(&mut self, bank_address: u32, data: &[u8]) -> DeviceResult<()> {
        self.tick(MockOp::WriteBulk)?;
        self.bulk.push((bank_address, data.to_vec()));
        Ok(())
    }

    fn poll_status(&mut self) -> DeviceResult<DeviceStatus> {
        self.tick(MockOp::PollStatus)?;

        if self.lamp_warmup_polls > 0 {
            self.lamp_warmup_polls -= 1;
        }

        if self.moving {
            self.polls_until_idle = self.polls_until_idle.saturating_sub(1);
            if self.polls_until_idle == 0 {
                self.moving = false;
                if !self.acquiring {
                    self.feed_finished = true;
                }
                self.home = self.model.at_home(&self.registers);
            }
        }

        Ok(DeviceStatus {
            motor_moving: self.moving,
            feed_finished: self.feed_finished,
            lamp_ready: self.lamp_warmup_polls == 0,
            home_sensor: self.home && !self.moving,
            data_available: self.acquiring,
        })
    }

    fn begin_motion(&mut self, with_data: bool) -> DeviceResult<()> {
        self.tick(MockOp::BeginMotion)?;
        self.moving = true;
        self.acquiring = with_data;
        self.feed_finished = false;
        self.home = false;
        self.polls_until_idle = self.motion_polls;
        Ok(())
    }

    fn stop_motion(&mut self) -> DeviceResult<()> {
        self.tick(MockOp::StopMotion)?;
        self.moving = false;
        self.acquiring = false;
        Ok(())
    }

    fn read_image_bytes(&mut self, n: usize) -> DeviceResult<Vec<u8>> {
        self.tick(MockOp::ReadImage)?;
        let reads = self.calls(MockOp::ReadImage);
        if let Some(hook) = self.read_hook.as_mut() {
            hook(reads);
        }
        let data = self.model.render(&self.registers, n);
        self.bytes_read += data.len();
        Ok(data)
    }
}
