use crate::checksum::compute_checksum;
use crate::constants::*;

use std::ops::Deref;

use derive_more::IsVariant;

/// A decoded command frame, as seen by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SioCommand {
    pub device: u8,
    pub command: u8,
    pub aux: [u8; 2],

    /// Bit rate the frame arrived at.
    pub cycles_per_bit: u32,
    pub standard_rate: bool,

    /// The command line went high before the frame finished.
    pub early_cmd_deassert: bool,

    /// Consecutive type 3 polls seen before this one.
    pub poll_count: u8,
}

impl Default for SioCommand {
    fn default() -> Self {
        SioCommand {
            device: 0,
            command: 0,
            aux: [0; 2],
            cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            standard_rate: true,
            early_cmd_deassert: false,
            poll_count: 0,
        }
    }
}

impl SioCommand {
    pub fn new(device: u8, command: u8, aux1: u8, aux2: u8) -> Self {
        SioCommand { device, command, aux: [aux1, aux2], ..Default::default() }
    }

    pub fn from_frame(frame: &[u8; COMMAND_FRAME_LEN], cycles_per_bit: u32) -> Self {
        SioCommand {
            device: frame[0],
            command: frame[1],
            aux: [frame[2], frame[3]],
            cycles_per_bit,
            standard_rate: is_standard_rate(cycles_per_bit),
            early_cmd_deassert: false,
            poll_count: 0,
        }
    }

    /// Device, command, aux1, aux2 and the checksum, as sent on the wire.
    pub fn frame(&self) -> [u8; COMMAND_FRAME_LEN] {
        build_frame(self.device, self.command, self.aux[0], self.aux[1])
    }

    pub fn aux_word(&self) -> u16 {
        u16::from_le_bytes(self.aux)
    }

    // ??/40/00/00
    pub fn is_type3_poll(&self) -> bool {
        self.command == POLL_COMMAND && self.aux == [0, 0]
    }

    pub fn is_disk(&self) -> bool {
        is_disk_device(self.device)
    }
}

pub fn build_frame(device: u8, command: u8, aux1: u8, aux2: u8) -> [u8; COMMAND_FRAME_LEN] {
    let body = [device, command, aux1, aux2];
    [device, command, aux1, aux2, compute_checksum(&body)]
}

pub fn is_standard_rate(cycles_per_bit: u32) -> bool {
    (STANDARD_RATE_MIN..=STANDARD_RATE_MAX).contains(&cycles_per_bit)
}

pub fn is_disk_device(device: u8) -> bool {
    (DISK_FIRST..=DISK_LAST).contains(&device)
}

////////////////////////////////////////////////////////////////////////////////

/// A command delivered through the accelerated path, with the parameters of the
/// OS-level request that produced it. Derefs to the [`SioCommand`] it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    pub cmd: SioCommand,
    pub mode: u8,
    pub timeout: u8,
    pub length: u16,
    pub sector: u16,
}

impl DeviceRequest {
    pub fn is_read(&self) -> bool {
        self.mode & MODE_READ != 0
    }

    pub fn is_write(&self) -> bool {
        self.mode & MODE_WRITE != 0
    }
}

impl Deref for DeviceRequest {
    type Target = SioCommand;

    fn deref(&self) -> &SioCommand {
        &self.cmd
    }
}

/// An OS-level serial request, as laid out by the caller in the device control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SioRequest {
    pub device: u8,
    pub command: u8,
    pub mode: u8,
    pub timeout: u8,
    pub address: u16,
    pub length: u16,
    pub sector: u16,
    pub aux: [u8; 2],
}

impl SioRequest {
    /// Both direction bits set isn't a well defined transfer.
    pub fn is_ambiguous_mode(&self) -> bool {
        self.mode & (MODE_READ | MODE_WRITE) == MODE_READ | MODE_WRITE
    }

    /// Whether the buffer overlaps `addr`.
    pub fn buffer_contains(&self, addr: u16) -> bool {
        self.address <= addr && ((addr - self.address) as u32) < self.length as u32
    }
}

////////////////////////////////////////////////////////////////////////////////

/// How a device answers a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum CmdResponse {
    /// Not ours; offer it to the next device.
    NotHandled,

    /// Only valid from the accelerated callback: don't accelerate this request at all,
    /// let the OS do it over the bus.
    BypassAccel,

    /// Claimed; the device already began a command and queued its steps.
    Start,

    /// Claimed; the bus manager answers ACK then Complete on the device's behalf.
    SendAckComplete,

    /// Claimed; the bus manager answers NAK on the device's behalf.
    FailNak,
}
