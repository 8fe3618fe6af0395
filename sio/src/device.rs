use crate::interface::SioInterface;
use crate::raw::RawBus;

use common::command::{CmdResponse, DeviceRequest, SioCommand};

/// A peripheral that speaks the command protocol. The bus manager offers each
/// command frame to devices in the order they were added; the first to claim it owns
/// the bus until it ends the command.
///
/// Every callback gets the device's own [`SioInterface`] to queue steps on.
pub trait SioDevice: Send {
    fn on_begin_command(&mut self, cmd: &SioCommand, iface: &mut SioInterface<'_>) -> CmdResponse;

    /// Same as [`SioDevice::on_begin_command`], but the request came straight from the
    /// OS and never touched the bus. May return [`CmdResponse::BypassAccel`].
    fn on_begin_command_accel(
        &mut self,
        request: &DeviceRequest,
        iface: &mut SioInterface<'_>,
    ) -> CmdResponse {
        self.on_begin_command(request, iface)
    }

    /// The command was cancelled, by the bus or by a new command truncating it.
    fn on_abort_command(&mut self) {}

    /// A receive step finished. `data` excludes the checksum byte for auto protocol
    /// receives.
    fn on_receive_complete(
        &mut self,
        _id: u32,
        _data: &[u8],
        _checksum_ok: bool,
        _iface: &mut SioInterface<'_>,
    ) {
    }

    fn on_fence(&mut self, _id: u32, _iface: &mut SioInterface<'_>) {}
}

/// A device that wants the bus unfiltered: every byte, line change and clock edge.
/// Each callback gets a [`RawBus`] for talking back.
pub trait SioRawDevice: Send {
    fn on_command_state_changed(&mut self, _asserted: bool, _bus: &mut RawBus<'_>) {}
    fn on_motor_state_changed(&mut self, _asserted: bool, _bus: &mut RawBus<'_>) {}
    fn on_ready_state_changed(&mut self, _asserted: bool, _bus: &mut RawBus<'_>) {}
    fn on_break_state_changed(&mut self, _enabled: bool, _bus: &mut RawBus<'_>) {}

    /// The computer started shifting out a byte.
    fn on_begin_receive_byte(
        &mut self,
        _val: u8,
        _command: bool,
        _cycles_per_bit: u32,
        _bus: &mut RawBus<'_>,
    ) {
    }

    fn on_receive_byte(
        &mut self,
        _val: u8,
        _command: bool,
        _cycles_per_bit: u32,
        _bus: &mut RawBus<'_>,
    ) {
    }

    /// A byte started by `on_begin_receive_byte` was cut short.
    fn on_truncate_byte(&mut self, _bus: &mut RawBus<'_>) {}

    fn on_send_ready(&mut self, _bus: &mut RawBus<'_>) {}

    /// Only for devices that asked with [`RawBus::set_bi_clock_notify`].
    fn on_serial_bi_clock_changed(&mut self, _cycles_per_bit: u32, _bus: &mut RawBus<'_>) {}
}
