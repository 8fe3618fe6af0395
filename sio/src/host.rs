use common::constants::*;

use delegate::delegate;
use log::trace;

/// 6502 processor status.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(u8);

impl Status {
    pub const CARRY_SHIFT: u8 = 0;
    pub const ZERO_SHIFT: u8 = 1;
    pub const IRQ_DISABLE_SHIFT: u8 = 2;
    pub const NEGATIVE_SHIFT: u8 = 7;

    pub const C: u8 = FLAG_C;
    pub const Z: u8 = FLAG_Z;
    pub const I: u8 = FLAG_I;
    pub const N: u8 = FLAG_N;

    pub fn new() -> Status {
        Default::default()
    }

    pub fn from_raw(raw: u8) -> Self {
        Status(raw)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn get_carry(&self) -> bool {
        (self.0 & Self::C) != 0
    }

    pub fn set_carry(&mut self, val: bool) {
        self.0 &= !(1u8 << Self::CARRY_SHIFT);
        self.0 |= (val as u8) << Self::CARRY_SHIFT;
    }

    pub fn get_zero(&self) -> bool {
        (self.0 & Self::Z) != 0
    }

    pub fn set_zero(&mut self, val: bool) {
        self.0 &= !(1u8 << Self::ZERO_SHIFT);
        self.0 |= (val as u8) << Self::ZERO_SHIFT;
    }

    pub fn get_irq_disable(&self) -> bool {
        (self.0 & Self::I) != 0
    }

    pub fn set_irq_disable(&mut self, val: bool) {
        self.0 &= !(1u8 << Self::IRQ_DISABLE_SHIFT);
        self.0 |= (val as u8) << Self::IRQ_DISABLE_SHIFT;
    }

    pub fn get_negative(&self) -> bool {
        (self.0 & Self::N) != 0
    }

    pub fn set_negative(&mut self, val: bool) {
        self.0 &= !(1u8 << Self::NEGATIVE_SHIFT);
        self.0 |= (val as u8) << Self::NEGATIVE_SHIFT;
    }

    /// N and Z as a load of `val` leaves them.
    pub fn set_nz(&mut self, val: u8) {
        self.set_negative(val & 0x80 != 0);
        self.set_zero(val == 0);
    }
}

/// The machine the accelerated path runs against: memory plus the few CPU registers
/// it returns results in.
pub trait SioHost {
    fn mem_read_byte(&self, addr: u16) -> u8;
    fn mem_write_byte(&mut self, addr: u16, val: u8);

    fn mem_read_word(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.mem_read_byte(addr), self.mem_read_byte(addr.wrapping_add(1))])
    }

    fn mem_write_word(&mut self, addr: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.mem_write_byte(addr, lo);
        self.mem_write_byte(addr.wrapping_add(1), hi);
    }

    fn get_status(&self) -> Status;
    fn set_status(&mut self, status: Status);

    fn set_a(&mut self, val: u8);
    fn set_x(&mut self, val: u8);
    fn set_y(&mut self, val: u8);

    /// Loads Y, setting N and Z from it.
    fn ldy(&mut self, val: u8) {
        self.set_y(val);
        let mut status = self.get_status();
        status.set_nz(val);
        self.set_status(status);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Flat 64K of RAM.
pub struct Memory(Vec<u8>);

impl Memory {
    pub fn new() -> Self {
        Memory(vec![0; (u16::MAX as usize) + 1])
    }

    pub fn mem_read_byte(&self, addr: u16) -> u8 {
        self.0[addr as usize]
    }

    pub fn mem_write_byte(&mut self, addr: u16, val: u8) {
        trace!("Mem: writing {val:#04x} to {addr:#06x}");
        self.0[addr as usize] = val;
    }

    /// Copies `data` in at `start`, wrapping at the top of memory.
    pub fn load(&mut self, data: &[u8], start: u16) {
        for (offset, &val) in data.iter().enumerate() {
            self.0[start.wrapping_add(offset as u16) as usize] = val;
        }
    }

    pub fn read(&self, start: u16, len: usize) -> Vec<u8> {
        (0..len).map(|offset| self.mem_read_byte(start.wrapping_add(offset as u16))).collect()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain [`SioHost`] over owned memory and registers, for tools and tests.
#[derive(Default)]
pub struct HostState {
    mem: Memory,
    a: u8,
    x: u8,
    y: u8,
    status: Status,
}

impl HostState {
    pub fn new() -> Self {
        Default::default()
    }

    delegate! {
        to self.mem {
            pub fn load(&mut self, data: &[u8], start: u16);
            pub fn read(&self, start: u16, len: usize) -> Vec<u8>;
        }
    }

    pub fn a(&self) -> u8 {
        self.a
    }

    pub fn x(&self) -> u8 {
        self.x
    }

    pub fn y(&self) -> u8 {
        self.y
    }

    pub fn get_status_mut(&mut self) -> &mut Status {
        &mut self.status
    }
}

impl SioHost for HostState {
    delegate! {
        to self.mem {
            fn mem_read_byte(&self, addr: u16) -> u8;
            fn mem_write_byte(&mut self, addr: u16, val: u8);
        }
    }

    fn get_status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn set_a(&mut self, val: u8) {
        self.a = val;
    }

    fn set_x(&mut self, val: u8) {
        self.x = val;
    }

    fn set_y(&mut self, val: u8) {
        self.y = val;
    }
}
