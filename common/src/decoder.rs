use crate::command::SioCommand;
use crate::constants::*;

use std::fmt;

/// Broad device families, by bus ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Printer,
    Disk,
    Serial,
    Cassette,
    Other,
}

impl DeviceClass {
    pub fn of(device: u8) -> DeviceClass {
        match device {
            0x40..=0x43 => DeviceClass::Printer,
            DISK_FIRST..=DISK_LAST => DeviceClass::Disk,
            0x50..=0x53 => DeviceClass::Serial,
            CASSETTE_DEVICE => DeviceClass::Cassette,
            _ => DeviceClass::Other,
        }
    }
}

/// Best guess at a human readable name for a command, for logs.
pub fn decode_command(device: u8, command: u8, aux: [u8; 2]) -> Option<&'static str> {
    if command == POLL_COMMAND {
        match aux {
            [0x00, 0x00] => return Some("Type 3 poll"),
            [0x4e, 0x4e] => return Some("Null poll"),
            [0x4f, 0x4f] => return Some("Poll reset"),
            _ => {}
        }
    }

    match (DeviceClass::of(device), command) {
        (DeviceClass::Disk, 0x21) => Some("Format"),
        (DeviceClass::Disk, 0x22) => Some("Format enhanced"),
        (DeviceClass::Disk, 0x3f) => Some("Get high speed index"),
        (DeviceClass::Disk, 0x4e) => Some("Read PERCOM block"),
        (DeviceClass::Disk, 0x4f) => Some("Write PERCOM block"),
        (DeviceClass::Disk, 0x50) => Some("Put sector"),
        (DeviceClass::Disk, READ_SECTOR_COMMAND) => Some("Read sector"),
        (DeviceClass::Disk, GET_STATUS_COMMAND) => Some("Get status"),
        (DeviceClass::Disk, 0x57) => Some("Write sector"),
        (DeviceClass::Printer, 0x53) => Some("Get status"),
        (DeviceClass::Printer, 0x57) => Some("Write"),
        (DeviceClass::Serial, 0x21) => Some("Download handler"),
        (DeviceClass::Serial, 0x42) => Some("Set baud rate"),
        (DeviceClass::Serial, 0x53) => Some("Get status"),
        (DeviceClass::Serial, 0x57) => Some("Write"),
        (DeviceClass::Serial, 0x58) => Some("Stream"),
        _ => None,
    }
}

/// Formats a command frame for tracing: `31 53 00 00 (Get status)`.
pub struct DisplayCommand<'a>(pub &'a SioCommand);

impl fmt::Display for DisplayCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cmd = self.0;
        write!(f, "{:02X} {:02X} {:02X} {:02X}", cmd.device, cmd.command, cmd.aux[0], cmd.aux[1])?;
        if let Some(name) = decode_command(cmd.device, cmd.command, cmd.aux) {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}
