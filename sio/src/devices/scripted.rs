use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::SioDevice;
use crate::interface::SioInterface;

use common::command::{CmdResponse, DeviceRequest, SioCommand};

use log::debug;

/// How a [`ScriptedDevice`] answers one command byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// ACK, Complete, then the data with its checksum.
    Data(Vec<u8>),

    /// ACK, Error, then the data with its checksum.
    Error(Vec<u8>),

    Nak,

    /// Leave the ACK and Complete to the bus manager.
    AckComplete,

    /// ACK, then take `len` bytes plus checksum from the computer. Complete if they
    /// check out.
    Receive { len: u32 },

    /// ACK, then Complete once a fence with `id` is reached.
    Fence { id: u32 },

    /// Refuse acceleration; acts like `AckComplete` on the bus.
    Bypass,

    /// Stay silent, as if the device wasn't there.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Command(SioCommand),
    AccelCommand(DeviceRequest),
    Abort,
    ReceiveComplete { id: u32, data: Vec<u8>, checksum_ok: bool },
    Fence(u32),
}

/// Everything a [`ScriptedDevice`] was told, readable while the device belongs to the
/// bus.
#[derive(Debug, Default)]
pub struct DeviceLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl DeviceLog {
    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries.lock().unwrap())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn push(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A device answering one ID from a table of canned replies. Commands not in the
/// table are NAKed.
pub struct ScriptedDevice {
    device_id: u8,
    replies: HashMap<u8, Reply>,
    transfer_rate: Option<(u32, u32)>,
    log: Arc<DeviceLog>,
}

impl ScriptedDevice {
    pub const RECEIVE_ID: u32 = 1;

    pub fn new(device_id: u8) -> Self {
        ScriptedDevice {
            device_id,
            replies: HashMap::new(),
            transfer_rate: None,
            log: Arc::new(DeviceLog::default()),
        }
    }

    pub fn with_reply(mut self, command: u8, reply: Reply) -> Self {
        self.replies.insert(command, reply);
        self
    }

    /// Answer at this rate instead of the standard one.
    pub fn with_transfer_rate(mut self, cycles_per_bit: u32, cycles_per_byte: u32) -> Self {
        self.transfer_rate = Some((cycles_per_bit, cycles_per_byte));
        self
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        self.log.clone()
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    fn respond(&mut self, command: u8, iface: &mut SioInterface<'_>) -> CmdResponse {
        let reply = self.replies.get(&command).cloned().unwrap_or(Reply::Nak);
        debug!(target: "sio::cmd", "Scripted device {:02X}: {reply:?}", self.device_id);

        match reply {
            Reply::Nak => return CmdResponse::FailNak,
            Reply::AckComplete | Reply::Bypass => return CmdResponse::SendAckComplete,
            Reply::Ignore => return CmdResponse::NotHandled,
            Reply::Data(ref data) | Reply::Error(ref data) if self.transfer_rate.is_none() => {
                iface.handle_command(data, matches!(reply, Reply::Data(_)));
                return CmdResponse::Start;
            }
            _ => {}
        }

        iface.begin_command();
        if let Some((cycles_per_bit, cycles_per_byte)) = self.transfer_rate {
            iface.set_transfer_rate(cycles_per_bit, cycles_per_byte);
        }
        iface.send_ack();

        match reply {
            Reply::Data(data) => {
                iface.send_complete(true);
                iface.send_data(&data, true);
                iface.end_command();
            }
            Reply::Error(data) => {
                iface.send_error(true);
                iface.send_data(&data, true);
                iface.end_command();
            }
            Reply::Receive { len } => iface.receive_data(Self::RECEIVE_ID, len, true),
            Reply::Fence { id } => iface.insert_fence(id),
            _ => {}
        }

        CmdResponse::Start
    }
}

impl SioDevice for ScriptedDevice {
    fn on_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface<'_>) -> CmdResponse {
        if cmd.device != self.device_id {
            return CmdResponse::NotHandled;
        }

        self.log.push(LogEntry::Command(*cmd));
        self.respond(cmd.command, iface)
    }

    fn on_begin_command_accel(
        &mut self,
        request: &DeviceRequest,
        iface: &mut SioInterface<'_>,
    ) -> CmdResponse {
        if request.device != self.device_id {
            return CmdResponse::NotHandled;
        }

        self.log.push(LogEntry::AccelCommand(*request));
        if self.replies.get(&request.command) == Some(&Reply::Bypass) {
            return CmdResponse::BypassAccel;
        }

        self.respond(request.command, iface)
    }

    fn on_abort_command(&mut self) {
        self.log.push(LogEntry::Abort);
    }

    fn on_receive_complete(
        &mut self,
        id: u32,
        data: &[u8],
        checksum_ok: bool,
        iface: &mut SioInterface<'_>,
    ) {
        self.log.push(LogEntry::ReceiveComplete { id, data: data.to_vec(), checksum_ok });

        match checksum_ok {
            true => iface.send_complete(true),
            false => iface.send_error(true),
        }
        iface.end_command();
    }

    fn on_fence(&mut self, id: u32, iface: &mut SioInterface<'_>) {
        self.log.push(LogEntry::Fence(id));
        iface.send_complete(true);
        iface.end_command();
    }
}
