use sio_lib::devices::{DeviceLog, LogEntry, Reply, ScriptedDevice};
use sio_lib::port::PipePort;
use sio_lib::{InterfaceId, SerialByte, SioConfig, SioDevice, SioInterface, SioManager};

use common::command::{build_frame, CmdResponse, SioCommand};
use common::constants::*;

use std::sync::{Arc, Mutex};

/// A manager wired to a recording port, driven the way the computer's serial port
/// would drive it.
pub struct Bus {
    pub sio: SioManager,
    pub port: Arc<PipePort>,
    pub cycles_per_bit: u32,
    pub cycles_per_byte: u32,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_config(SioConfig::default())
    }

    pub fn with_config(config: SioConfig) -> Self {
        let port = Arc::new(PipePort::default());
        Bus {
            sio: SioManager::with_config(port.clone(), config),
            port,
            cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
        }
    }

    pub fn add(&mut self, device: impl SioDevice + 'static) -> InterfaceId {
        self.sio.add_device(Box::new(device))
    }

    /// Adds a scripted device, returning its log.
    pub fn add_scripted(&mut self, device: ScriptedDevice) -> (InterfaceId, Arc<DeviceLog>) {
        let log = device.log();
        (self.add(device), log)
    }

    /// Shifts one byte out of the computer, taking a byte's worth of bus time.
    pub fn send_byte(&mut self, val: u8, command: bool) -> bool {
        self.sio.on_begin_bus_byte(val, command, self.cycles_per_bit);
        self.sio.advance(self.cycles_per_byte as u64);
        let start = self.sio.tick64() - self.cycles_per_byte as u64;
        self.sio.on_bus_byte(val, command, self.cycles_per_bit, start, false, false)
    }

    pub fn send_bytes(&mut self, data: &[u8]) {
        for &val in data {
            self.send_byte(val, false);
        }
    }

    /// Command line down, the frame, command line up.
    pub fn send_frame(&mut self, frame: [u8; COMMAND_FRAME_LEN]) {
        self.sio.begin_command_line();
        for val in frame {
            self.send_byte(val, true);
        }
        self.sio.end_command_line();
    }

    pub fn command(&mut self, device: u8, command: u8, aux1: u8, aux2: u8) {
        self.send_frame(build_frame(device, command, aux1, aux2));
    }

    /// Runs until nothing is scheduled.
    pub fn run_idle(&mut self) {
        while let Some(next) = self.sio.next_event_tick() {
            self.sio.run_until(next);
        }
    }

    pub fn run_until(&mut self, tick: u64) {
        self.sio.run_until(tick);
    }

    pub fn received(&self) -> Vec<SerialByte> {
        self.port.take_received().into_iter().collect()
    }

    pub fn values(&self) -> Vec<u8> {
        self.port.take_values()
    }
}

pub fn status_device() -> ScriptedDevice {
    ScriptedDevice::new(0x31).with_reply(GET_STATUS_COMMAND, Reply::Data(STATUS_DATA.to_vec()))
}

pub const STATUS_DATA: [u8; 4] = [0x10, 0x00, 0xe0, 0x00];

pub fn commands(log: &DeviceLog) -> Vec<u8> {
    log.entries()
        .into_iter()
        .filter_map(|entry| match entry {
            LogEntry::Command(cmd) => Some(cmd.command),
            LogEntry::AccelCommand(req) => Some(req.command),
            _ => None,
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////////////

/// Callbacks an [`FnDevice`] has seen.
pub type Calls = Arc<Mutex<Vec<&'static str>>>;

/// Does whatever the test hands it on each command, on the bus or accelerated.
pub struct FnDevice<F>(F, Calls);

impl<F> SioDevice for FnDevice<F>
where
    F: FnMut(&SioCommand, &mut SioInterface<'_>) -> CmdResponse + Send,
{
    fn on_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface<'_>) -> CmdResponse {
        self.1.lock().unwrap().push("begin");
        (self.0)(cmd, iface)
    }

    fn on_abort_command(&mut self) {
        self.1.lock().unwrap().push("abort");
    }
}

pub fn fn_device<F>(f: F) -> (FnDevice<F>, Calls)
where
    F: FnMut(&SioCommand, &mut SioInterface<'_>) -> CmdResponse + Send,
{
    let calls = Arc::new(Mutex::new(Vec::new()));
    (FnDevice(f, calls.clone()), calls)
}
