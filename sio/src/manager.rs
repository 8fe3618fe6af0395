use crate::accel::AccelState;
use crate::config::SioConfig;
use crate::device::{SioDevice, SioRawDevice};
use crate::error::{SaveStateError, SioError};
use crate::host::SioHost;
use crate::interface::{CommandPhase, DeviceEvent, DeviceInterface, InterfaceId, SioInterface};
use crate::port::SioPort;
use crate::raw::{RawBus, RawDeviceId, RawDevices};
use crate::save_state::{SavedActiveCommand, SavedBusState};
use crate::scheduler::Scheduler;
use crate::step::Step;

use common::checksum::verify_checksum;
use common::command::{is_disk_device, CmdResponse, DeviceRequest, SioCommand, SioRequest};
use common::constants::*;
use common::dcb::Dcb;
use common::decoder::DisplayCommand;

use std::collections::VecDeque;
use std::sync::Arc;

use delegate::delegate;
use log::{debug, error, info, trace};

/// Block transfers for the cassette fallback, done by whatever emulates the tape deck.
/// Both return the request status.
pub trait CassetteBlockIo: Send {
    fn read_block(
        &mut self,
        host: &mut dyn SioHost,
        address: u16,
        length: u16,
        timeout_secs: Option<f32>,
    ) -> u8;
    fn write_block(&mut self, host: &mut dyn SioHost, address: u16, length: u16) -> u8;
}

/// Bus wide state that device interfaces need while they run. Kept apart from the
/// device tables so a mutable borrow of it can go along with one device.
pub(crate) struct BusState {
    pub config: SioConfig,
    pub scheduler: Scheduler,
    pub port: Arc<dyn SioPort>,

    // Only while an accelerated request is being offered.
    pub accel: Option<AccelState>,

    // Allocations from the last finished command.
    pub cached_buffer: Vec<u8>,
    pub cached_steps: VecDeque<Step>,

    pub faults: Vec<SioError>,
    pub time_skew: u64,

    pub command_state: bool,
    pub motor_state: bool,
    pub ready_state: bool,
    loading_state: bool,

    command_cycles_per_bit: u32,
    command_buffer_index: usize,
    command_buffer: [u8; COMMAND_FRAME_LEN],
    pub command_frame_end_time: u64,
    pub command_deassert_time: u64,
    poll_count: u8,

    // Bit per disk drive that has seen a command over the bus.
    accessed_disks: u16,

    pending_interface: Option<InterfaceId>,
    pub pending_device_id: u8,
    pub pending_device_disk: bool,

    active: Vec<InterfaceId>,
    sending: Vec<InterfaceId>,
    receiving: Vec<InterfaceId>,
}

impl BusState {
    fn new(port: Arc<dyn SioPort>, config: SioConfig) -> Self {
        BusState {
            config,
            scheduler: Scheduler::new(),
            port,
            accel: None,
            cached_buffer: Vec::new(),
            cached_steps: VecDeque::new(),
            faults: Vec::new(),
            time_skew: 0,
            command_state: false,
            motor_state: false,
            ready_state: false,
            loading_state: false,
            command_cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            command_buffer_index: 0,
            command_buffer: [0; COMMAND_FRAME_LEN],
            command_frame_end_time: 0,
            command_deassert_time: 0,
            poll_count: 0,
            accessed_disks: 0,
            pending_interface: None,
            pending_device_id: 0,
            pending_device_disk: false,
            active: Vec::new(),
            sending: Vec::new(),
            receiving: Vec::new(),
        }
    }

    pub fn note_begin_command(&mut self, id: InterfaceId) {
        if self.pending_interface != Some(id) {
            return;
        }

        if self.pending_device_disk {
            self.accessed_disks |= 1 << (self.pending_device_id - DISK_FIRST);
        }

        if let Some(accel) = &self.accel {
            info!(target: "sio::accel", "Accelerating {}", DisplayCommand(&accel.request.cmd));
        }
    }

    pub fn add_active(&mut self, id: InterfaceId) {
        insert_unique(&mut self.active, id);
    }

    pub fn remove_active(&mut self, id: InterfaceId) {
        self.active.retain(|&a| a != id);
    }

    pub fn begin_receive(&mut self, id: InterfaceId) {
        insert_unique(&mut self.receiving, id);
    }

    pub fn end_receive(&mut self, id: InterfaceId) {
        self.receiving.retain(|&r| r != id);
    }

    pub fn begin_send(&mut self, id: InterfaceId) {
        insert_unique(&mut self.sending, id);
    }

    pub fn end_send(&mut self, id: InterfaceId) {
        self.sending.retain(|&s| s != id);
    }

    pub fn burst_allowed(&self, disk: bool) -> bool {
        match disk {
            true => self.config.disk_burst_enabled,
            false => self.config.burst_enabled,
        }
    }

    pub fn cycles_per_bit_bi_clock(&self) -> u32 {
        self.port.bi_clock_period() * 2
    }

    fn set_pending_device_id(&mut self, device: u8) {
        self.pending_device_id = device;
        self.pending_device_disk = is_disk_device(device);
    }

    // Counts back to back type 3 polls; anything else breaks the run.
    fn update_poll_state(&mut self, command: u8, aux: [u8; 2]) {
        if command == POLL_COMMAND && aux[0] == aux[1] {
            if aux[0] == 0 {
                self.poll_count = self.poll_count.wrapping_add(1);
            } else {
                self.poll_count = 0;
            }
        } else {
            self.poll_count = 0;
        }
    }
}

fn insert_unique(list: &mut Vec<InterfaceId>, id: InterfaceId) {
    if let Err(pos) = list.binary_search(&id) {
        list.insert(pos, id);
    }
}

////////////////////////////////////////////////////////////////////////////////

struct DeviceSlot {
    iface: DeviceInterface,
    device: Box<dyn SioDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccelResult {
    NotHandled,
    Bypass,
    Handled,
}

/// The serial bus: turns the computer's outgoing bytes into command frames for the
/// registered devices, runs their replies against bus time, and short circuits whole
/// requests when the OS serial routine is intercepted.
pub struct SioManager {
    state: BusState,
    interfaces: Vec<Option<DeviceSlot>>,
    raw: RawDevices,
    cassette: Option<Box<dyn CassetteBlockIo>>,
    disk_drives_enabled: u16,
    cycles_per_frame: u32,
}

impl SioManager {
    pub fn new(port: Arc<dyn SioPort>) -> Self {
        Self::with_config(port, SioConfig::default())
    }

    pub fn with_config(port: Arc<dyn SioPort>, config: SioConfig) -> Self {
        SioManager {
            state: BusState::new(port, config),
            interfaces: Vec::new(),
            raw: RawDevices::default(),
            cassette: None,
            disk_drives_enabled: 0,
            cycles_per_frame: NTSC_CYCLES_PER_FRAME,
        }
    }

    pub fn config(&self) -> &SioConfig {
        &self.state.config
    }

    pub fn config_mut(&mut self) -> &mut SioConfig {
        &mut self.state.config
    }

    pub fn set_config(&mut self, config: SioConfig) {
        self.state.config = config;
    }

    pub fn wants_serial_hook(&self) -> bool {
        self.state.config.wants_serial_hook()
    }

    pub fn port(&self) -> &Arc<dyn SioPort> {
        &self.state.port
    }

    delegate! {
        to self.state.port {
            pub fn cycles_per_bit_recv(&self) -> u32;
            pub fn cycles_per_bit_send(&self) -> u32;
            pub fn recv_reset_counter(&self) -> u32;
        }
    }

    pub fn cycles_per_bit_bi_clock(&self) -> u32 {
        self.state.cycles_per_bit_bi_clock()
    }

    pub fn is_command_asserted(&self) -> bool {
        self.state.command_state
    }

    pub fn is_motor_asserted(&self) -> bool {
        self.state.motor_state
    }

    pub fn is_ready_asserted(&self) -> bool {
        self.state.ready_state
    }

    pub fn is_interrupt_asserted(&self) -> bool {
        self.raw.is_interrupt_asserted()
    }

    pub fn is_proceed_asserted(&self) -> bool {
        self.raw.is_proceed_asserted()
    }

    pub fn poll_count(&self) -> u8 {
        self.state.poll_count
    }

    /// Bit per disk drive ($31 is bit 0) that has been sent a command over the bus
    /// since the last reset.
    pub fn accessed_disks(&self) -> u16 {
        self.state.accessed_disks
    }

    /// Contract violations by devices since the last call.
    pub fn take_faults(&mut self) -> Vec<SioError> {
        std::mem::take(&mut self.state.faults)
    }

    /// Bus time the accelerated path has skipped since the last call.
    pub fn take_time_skew(&mut self) -> u64 {
        std::mem::take(&mut self.state.time_skew)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Devices

    /// Registers a device; it's offered frames after every device added before it.
    pub fn add_device(&mut self, device: Box<dyn SioDevice>) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len());
        self.interfaces.push(Some(DeviceSlot { iface: DeviceInterface::new(), device }));
        debug!(target: "sio::cmd", "Added device interface {id:?}");
        id
    }

    /// Unregisters a device, cancelling its command first.
    pub fn remove_device(&mut self, id: InterfaceId) -> Option<Box<dyn SioDevice>> {
        self.run_interface(id, |iface| iface.cancel_command());

        let mut slot = self.interfaces.get_mut(id.0)?.take()?;
        for mut handle in slot.iface.take_events() {
            self.state.scheduler.unset_event(&mut handle);
        }

        self.state.end_receive(id);
        self.state.end_send(id);
        self.state.remove_active(id);
        if self.state.pending_interface == Some(id) {
            self.state.pending_interface = None;
        }

        debug!(target: "sio::cmd", "Removed device interface {id:?}");
        Some(slot.device)
    }

    /// Calls `f` with the interface of device `id`, as if from one of its callbacks.
    pub fn with_interface<R>(
        &mut self,
        id: InterfaceId,
        f: impl FnOnce(&mut SioInterface<'_>) -> R,
    ) -> Option<R> {
        self.run_interface(id, f)
    }

    pub fn is_command_active(&self, id: InterfaceId) -> bool {
        self.slot(id).is_some_and(|slot| slot.iface.is_command_active())
    }

    pub fn phase(&self, id: InterfaceId) -> CommandPhase {
        self.slot(id).map_or(CommandPhase::Idle, |slot| slot.iface.phase())
    }

    pub fn accel_time_skew(&self, id: InterfaceId) -> u32 {
        self.slot(id).map_or(0, |slot| slot.iface.accel_time_skew())
    }

    pub fn add_raw_device(&mut self, device: Box<dyn SioRawDevice>) -> RawDeviceId {
        self.raw.add(device)
    }

    /// Unregisters a raw device, dropping any bus line or clock it was holding.
    pub fn remove_raw_device(&mut self, id: RawDeviceId) -> Option<Box<dyn SioRawDevice>> {
        let now = self.state.scheduler.tick();
        self.raw.remove(id, &*self.state.port, now)
    }

    /// Calls `f` with raw device `id`'s view of the bus.
    pub fn with_raw_bus<R>(
        &mut self,
        id: RawDeviceId,
        f: impl FnOnce(&mut RawBus<'_>) -> R,
    ) -> Option<R> {
        if !self.raw.registry.contains(id) {
            return None;
        }
        Some(f(&mut RawBus::new(id, &mut self.state, &mut self.raw)))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Time

    pub fn tick64(&self) -> u64 {
        self.state.scheduler.tick64()
    }

    pub fn next_event_tick(&self) -> Option<u64> {
        self.state.scheduler.next_deadline()
    }

    pub fn advance(&mut self, ticks: u64) {
        self.run_until(self.tick64() + ticks);
    }

    /// Runs every event due by `tick`, in order, then moves the clock there.
    pub fn run_until(&mut self, tick: u64) {
        while let Some(event) = self.state.scheduler.pop_due(tick) {
            self.run_interface(event.target, |iface| iface.on_event(event.handle, event.kind));
        }
        self.state.scheduler.advance_to(tick);
    }

    /// Machine cycles per video frame, which cassette timeouts are counted in.
    pub fn set_frame_time(&mut self, cycles_per_frame: u32) {
        self.cycles_per_frame = cycles_per_frame;
    }

    ////////////////////////////////////////////////////////////////////////////
    // Computer side of the bus

    /// The computer started shifting out a byte.
    pub fn on_begin_bus_byte(&mut self, val: u8, command: bool, cycles_per_bit: u32) {
        self.notify_raw(|dev, bus| dev.on_begin_receive_byte(val, command, cycles_per_bit, bus));
    }

    /// A byte from the computer. Returns whether the port may burst the next one.
    pub fn on_bus_byte(
        &mut self,
        val: u8,
        command: bool,
        cycles_per_bit: u32,
        start_time: u64,
        framing_error: bool,
        truncated: bool,
    ) -> bool {
        if cycles_per_bit == 0 {
            return false;
        }

        trace!(
            target: "sio::cmd",
            "Computer > {val:02X} at {start_time}{}",
            if framing_error { " (framing error)" } else { "" }
        );

        let st = &mut self.state;
        let in_frame = st.command_state || st.command_buffer_index > 0;
        if in_frame && st.command_buffer_index < COMMAND_FRAME_LEN {
            st.command_cycles_per_bit = cycles_per_bit;
            st.command_buffer[st.command_buffer_index] = val;
            st.command_buffer_index += 1;

            if st.command_buffer_index == COMMAND_FRAME_LEN {
                st.command_frame_end_time = st.scheduler.tick64();

                // The line already dropped, so nothing else will close the frame.
                if !st.command_state {
                    self.process_command_frame();
                }
            }
        }

        let mut burst = false;
        for id in self.state.receiving.clone() {
            if !self.state.receiving.contains(&id) {
                continue;
            }

            if self.run_interface(id, |iface| iface.on_receive(val, cycles_per_bit)) == Some(true) {
                burst = true;
            }
        }

        self.notify_raw(|dev, bus| {
            dev.on_receive_byte(val, command, cycles_per_bit, bus);
            if truncated {
                dev.on_truncate_byte(bus);
            }
        });

        burst
    }

    pub fn begin_command_line(&mut self) {
        if !self.state.loading_state {
            self.state.command_buffer_index = 0;
        }

        if !self.state.command_state {
            self.state.command_state = true;
            self.notify_raw(|dev, bus| dev.on_command_state_changed(true, bus));
        }
    }

    pub fn end_command_line(&mut self) {
        if !self.state.command_state {
            return;
        }

        self.state.command_state = false;
        if self.state.loading_state {
            return;
        }

        self.state.command_deassert_time = self.tick64();

        if self.state.command_buffer_index >= COMMAND_FRAME_LEN {
            self.process_command_frame();
        }

        self.notify_raw(|dev, bus| dev.on_command_state_changed(false, bus));
    }

    pub fn set_motor_line(&mut self, asserted: bool) {
        if self.state.motor_state != asserted {
            self.state.motor_state = asserted;
            self.notify_raw(|dev, bus| dev.on_motor_state_changed(asserted, bus));
        }
    }

    pub fn set_ready_state(&mut self, asserted: bool) {
        if self.state.ready_state != asserted {
            self.state.ready_state = asserted;
            self.notify_raw(|dev, bus| dev.on_ready_state_changed(asserted, bus));
        }
    }

    pub fn set_break(&mut self, enabled: bool) {
        self.notify_raw(|dev, bus| dev.on_break_state_changed(enabled, bus));
    }

    /// The computer's serial input is ready for another byte.
    pub fn on_ser_in_ready(&mut self) {
        self.notify_raw(|dev, bus| dev.on_send_ready(bus));

        for id in self.state.sending.clone() {
            if !self.state.sending.contains(&id) {
                continue;
            }

            if self.run_interface(id, |iface| iface.on_send_ready()) != Some(true) {
                self.state.end_send(id);
            }
        }
    }

    /// The port's bidirectional clock changed speed.
    pub fn on_serial_output_clock_changed(&mut self) {
        let cycles_per_bit = self.state.cycles_per_bit_bi_clock();

        self.raw.registry.enter();
        for id in self.raw.bi_clock_notify_list() {
            if self.raw.registry.contains(id) {
                self.call_raw(id, &mut |dev: &mut dyn SioRawDevice, bus: &mut RawBus<'_>| {
                    dev.on_serial_bi_clock_changed(cycles_per_bit, bus)
                });
            }
        }
        self.raw.registry.leave();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Accelerated requests

    pub fn set_cassette(&mut self, cassette: Option<Box<dyn CassetteBlockIo>>) {
        self.cassette = cassette;
    }

    /// Whether drive `index` (0 for $31) is present, for the fast boot fallback.
    pub fn set_disk_drive_enabled(&mut self, index: u8, enabled: bool) {
        if index >= DISK_COUNT {
            return;
        }

        match enabled {
            true => self.disk_drives_enabled |= 1 << index,
            false => self.disk_drives_enabled &= !(1 << index),
        }
    }

    /// Entry from the OS serial routine hook: reads the device control block and tries
    /// to do the whole request here. Returns the opcode to resume at ($60, RTS) if
    /// handled, 0 to let the OS carry on.
    pub fn on_serial_hook(&mut self, host: &mut dyn SioHost, pc: u16) -> u8 {
        let mut bytes = [0u8; Dcb::SIZE];
        for (offset, byte) in bytes.iter_mut().enumerate() {
            *byte = host.mem_read_byte(Dcb::ADDR + offset as u16);
        }

        let request = Dcb::from_bytes(bytes).to_request();
        match self.try_accel_request(&request, host, pc == 0) {
            true => 0x60,
            false => 0,
        }
    }

    /// Entry from a parallel bus device's serial vector. Carry reports whether the
    /// request was done.
    pub fn try_accel_pbi_request(&mut self, enabled: bool, host: &mut dyn SioHost) {
        let handled = enabled && self.on_serial_hook(host, 0) != 0;

        let mut status = host.get_status();
        status.set_carry(handled);
        host.set_status(status);
    }

    /// Offers `request` to the devices without touching the bus. True if it was done,
    /// in which case the OS state and registers are left as the serial routine would.
    pub fn try_accel_request(
        &mut self,
        request: &SioRequest,
        host: &mut dyn SioHost,
        pbi: bool,
    ) -> bool {
        debug!(
            target: "sio::hook",
            "Request: device {:02X} command {:02X} mode {:02X} length {:04X} address {:04X}",
            request.device, request.command, request.mode, request.length, request.address
        );

        if !self.state.active.is_empty() || self.state.command_state {
            return false;
        }

        // The OS is watching for a timeout through this one.
        if request.buffer_contains(TIMFLG) {
            return false;
        }

        if host.mem_read_byte(BRKKEY) == 0 {
            return false;
        }

        if host.get_status().get_irq_disable() {
            return false;
        }

        if request.is_ambiguous_mode() {
            return false;
        }

        let config = self.state.config.clone();
        self.state.set_pending_device_id(request.device);

        let mut allow_accel = config.other_accel_enabled
            || (config.debugger_device_id != 0 && config.debugger_device_id == request.device);

        if self.state.pending_device_disk {
            allow_accel = config.disk_accel_enabled;

            let bit = 1 << (request.device - DISK_FIRST);
            let accessed = self.state.accessed_disks & bit != 0;
            if allow_accel && config.disk_override_detect_enabled && !accessed {
                return false;
            }
        }

        let device_request = |poll_count: u8| DeviceRequest {
            cmd: SioCommand {
                device: request.device,
                command: request.command,
                aux: request.aux,
                cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
                standard_rate: true,
                early_cmd_deassert: false,
                poll_count,
            },
            mode: request.mode,
            timeout: request.timeout,
            length: request.length,
            sector: request.sector,
        };

        let skew_before = self.state.time_skew;
        let first = device_request(self.state.poll_count);
        self.state.accel = Some(AccelState::new(first, request.address, &*host));

        let mut result = AccelResult::NotHandled;
        while allow_accel {
            let dev_request = device_request(self.state.poll_count);
            if let Some(accel) = self.state.accel.as_mut() {
                accel.request = dev_request;
            }

            let now = self.tick64();
            self.state.command_frame_end_time = now;
            self.state.command_deassert_time = now;

            result = self.offer_accel_request(&dev_request);
            if result != AccelResult::NotHandled {
                break;
            }

            // The kernel polls absent devices at boot many times over; answer the
            // retries here instead of letting each one time out on the bus. Counted
            // wide so a bound of 255 still ends.
            if config.fast_boot_enabled && dev_request.is_type3_poll() {
                let polls = self.state.poll_count as u16 + 1;
                self.state.poll_count = polls as u8;
                if polls <= config.fast_boot_poll_retries as u16 {
                    continue;
                }
            }
            break;
        }

        let accel = self.state.accel.take();
        self.state.pending_device_id = 0;
        self.state.pending_device_disk = false;

        let status = match (result, accel) {
            (AccelResult::Bypass, _) => {
                debug!(target: "sio::accel", "Device bypassed acceleration");
                self.state.time_skew = skew_before;
                return false;
            }
            (AccelResult::Handled, Some(accel)) => {
                accel.commit(host);
                accel.status
            }
            _ => {
                self.state.time_skew = skew_before;
                match self.accel_fallback(request, host, &config) {
                    Some(status) => status,
                    None => return false,
                }
            }
        };

        self.finish_accel_request(request, host, pbi, status);
        true
    }

    fn offer_accel_request(&mut self, request: &DeviceRequest) -> AccelResult {
        for idx in 0..self.interfaces.len() {
            let id = InterfaceId(idx);
            if self.slot(id).is_none() {
                continue;
            }

            self.state.pending_interface = Some(id);
            let result = self.try_accel_command(id, request);
            self.state.pending_interface = None;

            if result != AccelResult::NotHandled {
                return result;
            }
        }

        AccelResult::NotHandled
    }

    fn try_accel_command(&mut self, id: InterfaceId, request: &DeviceRequest) -> AccelResult {
        let skew_before = self.accel_time_skew(id);
        let response =
            self.call_device(id, |device, iface| device.on_begin_command_accel(request, iface));
        let Some(response) = response else {
            return AccelResult::NotHandled;
        };

        let device = request.device;
        let result = match response {
            CmdResponse::NotHandled => {
                self.reject_claim(id, SioError::NotHandledAfterQueue { device });
                AccelResult::NotHandled
            }
            CmdResponse::BypassAccel => {
                self.reject_claim(id, SioError::BypassAfterQueue { device });
                AccelResult::Bypass
            }
            CmdResponse::Start => AccelResult::Handled,
            CmdResponse::SendAckComplete => {
                self.reply_ack_complete(id);
                AccelResult::Handled
            }
            CmdResponse::FailNak => {
                self.reply_nak(id);
                AccelResult::Handled
            }
        };

        self.run_interface(id, |iface| iface.execute_next_step());

        // Nothing the device queued before declining actually happened.
        if result != AccelResult::Handled {
            if let Some(slot) = self.interfaces.get_mut(id.0).and_then(Option::as_mut) {
                slot.iface.set_accel_time_skew(skew_before);
            }
        }
        result
    }

    // Requests nobody claimed that are still answered here.
    fn accel_fallback(
        &mut self,
        request: &SioRequest,
        host: &mut dyn SioHost,
        config: &SioConfig,
    ) -> Option<u8> {
        let device = request.device;

        if is_disk_device(device) {
            let present = self.disk_drives_enabled & (1 << (device - DISK_FIRST)) != 0;
            if present || !config.fast_boot_enabled {
                return None;
            }

            debug!(target: "sio::accel", "Fast boot: timing out absent disk {device:02X}");
            return Some(STATUS_TIMEOUT);
        }

        match device {
            FAST_BOOT_DEVICE if config.fast_boot_enabled => {
                debug!(target: "sio::accel", "Fast boot: timing out device {device:02X}");
                Some(STATUS_TIMEOUT)
            }
            CASSETTE_DEVICE if config.cassette_patch_enabled => {
                let cassette = self.cassette.as_mut()?;

                let status = if request.mode & MODE_WRITE == 0 {
                    // The OS timeout is in units of 64 frames.
                    let frames = request.timeout as f64 * 64.0;
                    let timeout = match request.timeout {
                        0 => None,
                        _ => Some((frames * self.cycles_per_frame as f64 / MASTER_CLOCK_HZ) as f32),
                    };
                    cassette.read_block(host, request.address, request.length, timeout)
                } else {
                    cassette.write_block(host, request.address, request.length)
                };

                debug!(
                    target: "sio::accel",
                    "Cassette block of {} bytes: status {status:02X}",
                    request.length
                );
                Some(status)
            }
            _ => None,
        }
    }

    // Leave the machine as the OS serial routine would on return.
    fn finish_accel_request(
        &mut self,
        request: &SioRequest,
        host: &mut dyn SioHost,
        pbi: bool,
        status: u8,
    ) {
        self.state.update_poll_state(request.command, request.aux);

        // The OS reprograms POKEY for the bus rate; the cassette runs slower and
        // restores it itself.
        if request.device != CASSETTE_DEVICE {
            host.mem_write_byte(AUDF3, AUDF3_DEFAULT);
            host.mem_write_byte(AUDF4, AUDF4_DEFAULT);
            host.mem_write_byte(SKCTL, SKCTL_DEFAULT);
            host.mem_write_byte(SSKCTL, SKCTL_DEFAULT);
        }

        if host.mem_read_word(CDTMA1) == 0 {
            host.mem_write_word(CDTMA1, CDTMA1_DEFAULT);
        }

        host.mem_write_byte(CHKSNT, 0xFF);

        if !pbi {
            host.mem_write_byte(CRITIC, 0);
        }

        host.mem_write_byte(STATUS, status);
        host.mem_write_byte(DSTATS, status);
        host.mem_write_byte(TIMFLG, (status != STATUS_TIMEOUT) as u8);

        let mut p = host.get_status();
        p.set_carry(status == STATUS_SUCCESS || status >= STATUS_TIMEOUT);
        host.set_status(p);

        host.set_a(0);
        host.set_x(0xFE);
        host.ldy(status);

        debug!(target: "sio::hook", "Request done: status {status:02X}");
    }

    ////////////////////////////////////////////////////////////////////////////
    // Lifecycle

    pub fn cancel_all_commands(&mut self) {
        for id in self.state.active.clone() {
            self.run_interface(id, |iface| iface.cancel_command());
        }
    }

    pub fn cold_reset(&mut self) {
        self.state.loading_state = false;
        self.cancel_all_commands();
        self.state.command_buffer_index = 0;
        self.end_command_line();
        self.state.motor_state = false;
        self.state.pending_interface = None;
        self.state.pending_device_id = 0;
        self.state.pending_device_disk = false;
        self.warm_reset();
    }

    pub fn warm_reset(&mut self) {
        self.state.accessed_disks = 0;
    }

    ////////////////////////////////////////////////////////////////////////////
    // Save state

    /// The command frame in progress, if any.
    pub fn save_state(&self) -> Option<SavedBusState> {
        let st = &self.state;
        let partial = st.command_buffer_index > 0 && st.command_buffer_index < COMMAND_FRAME_LEN;
        if !st.command_state && !partial {
            return None;
        }

        Some(SavedBusState {
            command_cycles_per_bit: st.command_cycles_per_bit,
            command_buffer_index: st.command_buffer_index as u8,
            command_buffer: st.command_buffer,
        })
    }

    /// Cancels everything and holds off frame processing until
    /// [`SioManager::post_load_state`].
    pub fn pre_load_state(&mut self) {
        self.cancel_all_commands();
        self.state.loading_state = true;
        self.state.command_buffer_index = 0;
    }

    pub fn load_state(&mut self, state: Option<&SavedBusState>) -> Result<(), SaveStateError> {
        let Some(state) = state else {
            return Ok(());
        };

        state.validate()?;
        self.state.command_buffer_index = state.command_buffer_index as usize;
        self.state.command_cycles_per_bit = state.command_cycles_per_bit;
        self.state.command_buffer = state.command_buffer;
        Ok(())
    }

    pub fn post_load_state(&mut self) {
        self.state.loading_state = false;
    }

    pub fn save_active_command_state(&self, id: InterfaceId) -> Option<SavedActiveCommand> {
        self.slot(id)?.iface.save_active_command(&self.state.scheduler)
    }

    pub fn load_active_command_state(
        &mut self,
        id: InterfaceId,
        state: &SavedActiveCommand,
    ) -> Result<(), SaveStateError> {
        self.run_interface(id, |iface| {
            let result = iface.load_active_command_state(state);
            iface.execute_next_step();
            result
        })
        .unwrap_or(Err(SaveStateError::UnknownInterface))
    }

    ////////////////////////////////////////////////////////////////////////////

    fn slot(&self, id: InterfaceId) -> Option<&DeviceSlot> {
        self.interfaces.get(id.0).and_then(Option::as_ref)
    }

    // Runs `f` on the interface, then delivers whatever it owes the device.
    fn run_interface<R>(
        &mut self,
        id: InterfaceId,
        f: impl FnOnce(&mut SioInterface<'_>) -> R,
    ) -> Option<R> {
        let slot = self.interfaces.get_mut(id.0)?.as_mut()?;
        let result = f(&mut SioInterface::new(id, &mut slot.iface, &mut self.state));
        self.pump(id);
        Some(result)
    }

    fn call_device<R>(
        &mut self,
        id: InterfaceId,
        f: impl FnOnce(&mut dyn SioDevice, &mut SioInterface<'_>) -> R,
    ) -> Option<R> {
        let slot = self.interfaces.get_mut(id.0)?.as_mut()?;
        let mut iface = SioInterface::new(id, &mut slot.iface, &mut self.state);
        Some(f(slot.device.as_mut(), &mut iface))
    }

    // Delivers queued notifications one at a time, letting the steps they unblock run
    // in between.
    fn pump(&mut self, id: InterfaceId) {
        loop {
            let Some(slot) = self.interfaces.get_mut(id.0).and_then(Option::as_mut) else {
                return;
            };

            let Some(event) = slot.iface.events.pop_front() else {
                return;
            };

            let mut iface = SioInterface::new(id, &mut slot.iface, &mut self.state);
            match event {
                DeviceEvent::Abort => slot.device.on_abort_command(),
                DeviceEvent::Fence(fence) => slot.device.on_fence(fence, &mut iface),
                DeviceEvent::ReceiveComplete { id: recv, data, checksum_ok } => {
                    slot.device.on_receive_complete(recv, &data, checksum_ok, &mut iface)
                }
            }
            iface.execute_next_step();
        }
    }

    fn process_command_frame(&mut self) {
        let frame = self.state.command_buffer;
        if !verify_checksum(&frame) {
            debug!(target: "sio::cmd", "Bad checksum on command frame {frame:02X?}");
            return;
        }

        let early = self.state.command_deassert_time < self.state.command_frame_end_time;
        let cmd = SioCommand {
            early_cmd_deassert: early,
            poll_count: self.state.poll_count,
            ..SioCommand::from_frame(&frame, self.state.command_cycles_per_bit)
        };

        self.state.update_poll_state(cmd.command, cmd.aux);

        debug!(
            target: "sio::cmd",
            "Command {}{}",
            DisplayCommand(&cmd),
            if cmd.standard_rate { "" } else { " (high-speed command frame)" }
        );

        self.state.set_pending_device_id(cmd.device);

        for idx in 0..self.interfaces.len() {
            if self.try_process_command(InterfaceId(idx), &cmd) {
                break;
            }
        }

        self.state.pending_interface = None;
    }

    fn try_process_command(&mut self, id: InterfaceId, cmd: &SioCommand) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        if slot.iface.deassert_check && cmd.early_cmd_deassert {
            return false;
        }

        if slot.iface.is_command_active() {
            if !slot.iface.truncation {
                return false;
            }

            // Abort goes out before the new frame does.
            self.run_interface(id, |iface| iface.cancel_command());
        }

        self.state.pending_interface = Some(id);
        let response = self.call_device(id, |device, iface| device.on_begin_command(cmd, iface));
        let Some(response) = response else {
            return false;
        };

        let claimed = match response {
            CmdResponse::NotHandled => {
                self.reject_claim(id, SioError::NotHandledAfterQueue { device: cmd.device });
                false
            }
            CmdResponse::BypassAccel => {
                self.record_fault(SioError::BypassFromNormalCallback { device: cmd.device });
                self.run_interface(id, |iface| iface.cancel_command());
                false
            }
            CmdResponse::Start => true,
            CmdResponse::SendAckComplete => {
                self.reply_ack_complete(id);
                true
            }
            CmdResponse::FailNak => {
                self.reply_nak(id);
                true
            }
        };

        self.run_interface(id, |iface| iface.execute_next_step());
        claimed
    }

    fn reply_ack_complete(&mut self, id: InterfaceId) {
        self.run_interface(id, |iface| {
            iface.begin_command();
            iface.send_ack();
            iface.send_complete(true);
            iface.end_command();
        });
    }

    fn reply_nak(&mut self, id: InterfaceId) {
        self.run_interface(id, |iface| {
            iface.begin_command();
            iface.send_nak();
            iface.end_command();
        });
    }

    // A device that declines must not leave a command behind.
    fn reject_claim(&mut self, id: InterfaceId, err: SioError) {
        if self.is_command_active(id) {
            self.record_fault(err);
            self.run_interface(id, |iface| iface.cancel_command());
        }
    }

    fn record_fault(&mut self, err: SioError) {
        error!(target: "sio::cmd", "{err}");
        self.state.faults.push(err);
    }

    fn notify_raw(&mut self, mut f: impl FnMut(&mut dyn SioRawDevice, &mut RawBus<'_>)) {
        self.raw.registry.enter();
        for idx in 0..self.raw.registry.live_len() {
            if let Some(id) = self.raw.registry.get(idx) {
                self.call_raw(id, &mut f);
            }
        }
        self.raw.registry.leave();
    }

    fn call_raw(
        &mut self,
        id: RawDeviceId,
        f: &mut impl FnMut(&mut dyn SioRawDevice, &mut RawBus<'_>),
    ) {
        let Some(mut device) = self.raw.take(id) else {
            return;
        };

        f(device.as_mut(), &mut RawBus::new(id, &mut self.state, &mut self.raw));
        self.raw.restore(id, device);
    }
}
