use std::collections::VecDeque;
use std::sync::Mutex;

use common::constants::DEFAULT_CYCLES_PER_BIT;

/// A byte put on the bus by a device, headed for the computer's serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialByte {
    pub value: u8,
    pub cycles_per_bit: u32,

    /// Bus time the byte was sent at.
    pub time: u64,

    /// Deliver as if shifted in bit by bit.
    pub simulate_input: bool,
    pub allow_burst: bool,
    pub synchronous: bool,
    pub framing_error: bool,
}

impl SerialByte {
    pub fn new(value: u8, cycles_per_bit: u32, time: u64) -> Self {
        SerialByte {
            value,
            cycles_per_bit,
            time,
            simulate_input: true,
            allow_burst: false,
            synchronous: false,
            framing_error: false,
        }
    }
}

/// The computer side of the bus: the serial port that receives what devices send and
/// owns the shared lines.
pub trait SioPort: Send + Sync {
    fn receive_byte(&self, byte: SerialByte);

    fn set_data_line(&self, _level: bool) {}

    fn cycles_per_bit_recv(&self) -> u32 {
        DEFAULT_CYCLES_PER_BIT
    }

    fn cycles_per_bit_send(&self) -> u32 {
        DEFAULT_CYCLES_PER_BIT
    }

    /// Counter that changes whenever the port's receive state is reset.
    fn recv_reset_counter(&self) -> u32 {
        0
    }

    /// Period of the bidirectional serial clock, or 0 if it isn't running.
    fn bi_clock_period(&self) -> u32 {
        0
    }

    fn is_force_break(&self) -> bool {
        false
    }

    /// A period of 0 disables the external clock.
    fn set_external_clock(&self, _time_base: u32, _period: u32) {}

    fn set_bi_clock_notify(&self, _enabled: bool) {}

    fn set_interrupt_line(&self, _asserted: bool) {}

    fn set_proceed_line(&self, _asserted: bool) {}
}

////////////////////////////////////////////////////////////////////////////////

/// Discards everything.
#[derive(Default, Clone, Copy)]
pub struct NullPort;

impl SioPort for NullPort {
    fn receive_byte(&self, _byte: SerialByte) {}
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortLines {
    pub data: Option<bool>,
    pub interrupt: bool,
    pub proceed: bool,
    pub bi_clock_notify: bool,
    pub external_clock: Option<(u32, u32)>,
}

/// Records what the bus does to the port, for tests and tools.
#[derive(Default)]
pub struct PipePort {
    received: Mutex<VecDeque<SerialByte>>,
    lines: Mutex<PortLines>,
    recv_cycles_per_bit: Mutex<Option<u32>>,
    bi_clock_period: Mutex<u32>,
}

impl PipePort {
    pub fn take_received(&self) -> VecDeque<SerialByte> {
        std::mem::take(&mut self.received.lock().unwrap())
    }

    /// Just the values of everything received so far, which is consumed.
    pub fn take_values(&self) -> Vec<u8> {
        self.take_received().into_iter().map(|b| b.value).collect()
    }

    pub fn pop_received(&self) -> Option<SerialByte> {
        self.received.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().unwrap().is_empty()
    }

    pub fn lines(&self) -> PortLines {
        *self.lines.lock().unwrap()
    }

    pub fn set_recv_cycles_per_bit(&self, cycles_per_bit: u32) {
        *self.recv_cycles_per_bit.lock().unwrap() = Some(cycles_per_bit);
    }

    pub fn set_bi_clock_period(&self, period: u32) {
        *self.bi_clock_period.lock().unwrap() = period;
    }
}

impl SioPort for PipePort {
    fn receive_byte(&self, byte: SerialByte) {
        self.received.lock().unwrap().push_back(byte);
    }

    fn set_data_line(&self, level: bool) {
        self.lines.lock().unwrap().data = Some(level);
    }

    fn cycles_per_bit_recv(&self) -> u32 {
        self.recv_cycles_per_bit.lock().unwrap().unwrap_or(DEFAULT_CYCLES_PER_BIT)
    }

    fn bi_clock_period(&self) -> u32 {
        *self.bi_clock_period.lock().unwrap()
    }

    fn set_external_clock(&self, time_base: u32, period: u32) {
        self.lines.lock().unwrap().external_clock = (period != 0).then_some((time_base, period));
    }

    fn set_bi_clock_notify(&self, enabled: bool) {
        self.lines.lock().unwrap().bi_clock_notify = enabled;
    }

    fn set_interrupt_line(&self, asserted: bool) {
        self.lines.lock().unwrap().interrupt = asserted;
    }

    fn set_proceed_line(&self, asserted: bool) {
        self.lines.lock().unwrap().proceed = asserted;
    }
}
