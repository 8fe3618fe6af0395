use crate::error::{SaveStateError, SioError};
use crate::manager::BusState;
use crate::port::SerialByte;
use crate::save_state::{SavedActiveCommand, SavedStep};
use crate::scheduler::{EventHandle, EventKind, Scheduler};
use crate::step::Step;
use crate::transfer::TransferBuffer;

use common::checksum::{compute_checksum, verify_checksum};
use common::command::is_disk_device;
use common::constants::*;

use std::collections::VecDeque;
use std::mem;

use log::{debug, error, trace, warn};

/// Identifies a device registered with the bus manager. Lower IDs were registered
/// earlier and get first refusal on command frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub(crate) usize);

impl InterfaceId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// No command.
    Idle,

    /// Command active, nothing executing; the queue is empty or waiting on a
    /// notification to be delivered.
    Queued,

    /// A step is in progress.
    Running,
}

/// Callbacks owed to the device. They're delivered by the bus manager once the
/// current call into the interface returns, so a device never re-enters itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    Abort,
    Fence(u32),
    ReceiveComplete { id: u32, data: Vec<u8>, checksum_ok: bool },
}

/// Per device command state, owned by the bus manager.
#[derive(Debug)]
pub(crate) struct DeviceInterface {
    transfer_cycles_per_bit: u32,
    transfer_cycles_per_bit_recv_min: u32,
    transfer_cycles_per_bit_recv_max: u32,
    transfer_cycles_per_byte: u32,
    transfer_start_time: u32,
    burst_offset: u32,
    last_burst_offset: u32,

    buffer: TransferBuffer,
    transfer_send: bool,
    transfer_error: bool, // Receive bit rate was off.
    transmit_synchronous: bool,

    command_active: bool,
    pub deassert_check: bool,
    pub truncation: bool,

    active_device_disk: bool,
    active_device_id: u8,

    delay_event: Option<EventHandle>,
    transfer_event: Option<EventHandle>,

    // Cycles the accelerated path skipped that a real transfer would have taken.
    accel_time_skew: u32,

    command_frame_end_time: u64,
    command_deassert_time: u64,
    command_queue_time: u64,
    command_queue_cycles_per_byte: u32,

    current_step: Option<Step>,
    steps: VecDeque<Step>,
    pub events: VecDeque<DeviceEvent>,
}

impl DeviceInterface {
    pub fn new() -> Self {
        let mut iface = DeviceInterface {
            transfer_cycles_per_bit: DEFAULT_CYCLES_PER_BIT,
            transfer_cycles_per_bit_recv_min: 0,
            transfer_cycles_per_bit_recv_max: 0,
            transfer_cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
            transfer_start_time: 0,
            burst_offset: 0,
            last_burst_offset: 0,
            buffer: TransferBuffer::new(),
            transfer_send: false,
            transfer_error: false,
            transmit_synchronous: false,
            command_active: false,
            deassert_check: false,
            truncation: false,
            active_device_disk: false,
            active_device_id: 0,
            delay_event: None,
            transfer_event: None,
            accel_time_skew: 0,
            command_frame_end_time: 0,
            command_deassert_time: 0,
            command_queue_time: 0,
            command_queue_cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
            current_step: None,
            steps: VecDeque::new(),
            events: VecDeque::new(),
        };
        iface.update_transfer_rate_derived_values();
        iface
    }

    pub fn is_command_active(&self) -> bool {
        self.command_active
    }

    pub fn phase(&self) -> CommandPhase {
        match (self.command_active, self.current_step) {
            (false, _) => CommandPhase::Idle,
            (true, None) => CommandPhase::Queued,
            (true, Some(_)) => CommandPhase::Running,
        }
    }

    pub fn accel_time_skew(&self) -> u32 {
        self.accel_time_skew
    }

    pub fn set_accel_time_skew(&mut self, skew: u32) {
        self.accel_time_skew = skew;
    }

    /// Event handles to drop when the interface goes away.
    pub fn take_events(&mut self) -> [Option<EventHandle>; 2] {
        [self.delay_event.take(), self.transfer_event.take()]
    }

    pub fn save_active_command(&self, sched: &Scheduler) -> Option<SavedActiveCommand> {
        if !self.command_active {
            return None;
        }

        let buf = &self.buffer;
        let span = |pos: usize, len: usize| {
            buf.as_slice().get(pos..pos + len).map(<[u8]>::to_vec).unwrap_or_default()
        };

        let current_step = self.current_step.map(|step| {
            let data = if step.is_send_step() {
                span(buf.start(), step.transfer_len())
            } else if step.is_receive_step() {
                buf.transferred().to_vec()
            } else {
                Vec::new()
            };
            SavedStep::from_step(&step, data)
        });

        let mut transfer_pos = buf.end();
        let steps = self.steps.iter().map(|step| {
            let len = step.transfer_len();
            let data = match step.is_send_step() {
                true => span(transfer_pos, len),
                false => Vec::new(),
            };
            transfer_pos += len;
            SavedStep::from_step(step, data)
        }).collect();

        let t64 = sched.tick64();
        let step_delay = match (self.transfer_event, self.delay_event) {
            (Some(handle), _) | (None, Some(handle)) => sched.ticks_to_event(handle),
            (None, None) => 0,
        };

        Some(SavedActiveCommand {
            device_id: self.active_device_id,
            transfer_index: (buf.index() - buf.start()) as u32,
            transfer_error: self.transfer_error,
            transfer_cycles_per_bit: self.transfer_cycles_per_bit,
            transfer_cycles_per_byte: self.transfer_cycles_per_byte,
            transmit_synchronous: self.transmit_synchronous,
            transfer_start_time: self.transfer_start_time.wrapping_sub(t64 as u32) as i32,
            step_delay,
            queue_time: self.command_queue_time.wrapping_sub(t64) as i64,
            queue_cycles_per_byte: self.command_queue_cycles_per_byte,
            command_frame_end_time: self.command_frame_end_time.wrapping_sub(t64) as i64,
            command_deassert_time: self.command_deassert_time.wrapping_sub(t64) as i64,
            current_step,
            steps,
        })
    }

    fn update_transfer_rate_derived_values(&mut self) {
        let slop = (self.transfer_cycles_per_bit + 19) / 20;
        self.transfer_cycles_per_bit_recv_min = self.transfer_cycles_per_bit.saturating_sub(slop);
        self.transfer_cycles_per_bit_recv_max = self.transfer_cycles_per_bit + slop;
    }

    fn reset_transfer_params(&mut self) {
        self.transfer_cycles_per_byte = DEFAULT_CYCLES_PER_BYTE;
        self.transfer_cycles_per_bit = DEFAULT_CYCLES_PER_BIT;
        self.transmit_synchronous = false;
        self.command_queue_cycles_per_byte = self.transfer_cycles_per_byte;
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A device's view of the bus, handed to every [`SioDevice`](crate::SioDevice)
/// callback. Commands are built by queueing steps, which run in order as bus time
/// passes (or all at once on the accelerated path).
///
/// Queueing anything without an active command does nothing beyond recording a
/// [`SioError::NoActiveCommand`] fault.
pub struct SioInterface<'a> {
    id: InterfaceId,
    iface: &'a mut DeviceInterface,
    bus: &'a mut BusState,
}

impl<'a> SioInterface<'a> {
    pub(crate) fn new(
        id: InterfaceId,
        iface: &'a mut DeviceInterface,
        bus: &'a mut BusState,
    ) -> Self {
        SioInterface { id, iface, bus }
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn is_command_active(&self) -> bool {
        self.iface.command_active
    }

    pub fn phase(&self) -> CommandPhase {
        self.iface.phase()
    }

    pub fn is_active_command_accelerated(&self) -> bool {
        self.bus.accel.is_some()
    }

    pub fn active_device_id(&self) -> u8 {
        self.iface.active_device_id
    }

    pub fn tick64(&self) -> u64 {
        self.bus.scheduler.tick64()
    }

    pub fn accel_time_skew(&self) -> u32 {
        self.iface.accel_time_skew
    }

    /// Estimated bus time at which everything queued so far will have gone out.
    pub fn command_queue_time(&self) -> u64 {
        self.iface.command_queue_time
    }

    pub fn command_frame_end_time(&self) -> u64 {
        self.iface.command_frame_end_time
    }

    pub fn command_deassert_time(&self) -> u64 {
        self.iface.command_deassert_time
    }

    pub fn transfer_cycles_per_bit(&self) -> u32 {
        self.iface.transfer_cycles_per_bit
    }

    pub fn transfer_cycles_per_byte(&self) -> u32 {
        self.iface.transfer_cycles_per_byte
    }

    /// Ignore frames whose command line went high before the frame was done.
    pub fn set_command_deassert_check_enabled(&mut self, enabled: bool) {
        self.iface.deassert_check = enabled;
    }

    /// Let a new frame cut off a command that's still running.
    pub fn set_command_truncation_enabled(&mut self, enabled: bool) {
        self.iface.truncation = enabled;
    }

    pub fn begin_command(&mut self) {
        if self.iface.command_active {
            self.cancel_command();
        }

        debug_assert!(self.iface.steps.is_empty());

        self.iface.command_deassert_time = self.bus.command_deassert_time;
        self.iface.command_frame_end_time = self.bus.command_frame_end_time;
        self.iface.command_queue_time = self.bus.scheduler.tick64();

        self.iface.buffer = TransferBuffer::from_vec(mem::take(&mut self.bus.cached_buffer));

        mem::swap(&mut self.iface.steps, &mut self.bus.cached_steps);
        self.iface.steps.clear();

        self.bus.note_begin_command(self.id);

        if self.bus.accel.is_some() {
            // Command line assert, the frame itself and the deassert that never happened.
            self.add_accel_skew(ACCEL_COMMAND_FRAME_SKEW);
        }

        self.bus.add_active(self.id);

        self.iface.active_device_id = self.bus.pending_device_id;
        self.iface.active_device_disk = self.bus.pending_device_disk;

        self.iface.reset_transfer_params();
        self.iface.buffer.reset_cursors();
        self.iface.command_active = true;
    }

    pub fn send_data(&mut self, data: &[u8], add_checksum: bool) {
        if !self.iface.command_active {
            return self.ignore("send");
        }

        if data.is_empty() {
            return;
        }

        let len = data.len() + add_checksum as usize;
        let chk = add_checksum.then(|| compute_checksum(data));
        let result = self.iface.buffer.reserve(len)
            .and_then(|()| self.iface.buffer.append(data))
            .and_then(|()| self.iface.buffer.append(chk.as_slice()));

        if let Err(err) = result {
            return self.fault(err);
        }

        let cycles_per_byte = self.iface.command_queue_cycles_per_byte as u64;
        self.iface.command_queue_time += len as u64 * cycles_per_byte;

        let len = len as u32;
        self.iface.steps.push_back(match add_checksum {
            true => Step::SendAutoProtocol { len },
            false => Step::Send { len },
        });

        self.execute_next_step();
    }

    pub fn send_ack(&mut self) {
        if !self.iface.command_active {
            return self.ignore("ACK");
        }

        debug!(target: "sio::reply", "Device {:02X} > ACK", self.iface.active_device_id);
        match self.bus.accel.is_some() {
            true => self.iface.steps.push_back(Step::AccelSendAck),
            false => self.send_data(&[ACK], false),
        }
    }

    pub fn send_nak(&mut self) {
        if !self.iface.command_active {
            return self.ignore("NAK");
        }

        debug!(target: "sio::reply", "Device {:02X} > NAK", self.iface.active_device_id);
        match self.bus.accel.is_some() {
            true => self.iface.steps.push_back(Step::AccelSendNak),
            false => self.send_data(&[NAK], false),
        }
    }

    /// With `auto_delay`, waits out the minimum gap the protocol requires first.
    pub fn send_complete(&mut self, auto_delay: bool) {
        if !self.iface.command_active {
            return self.ignore("Complete");
        }

        if auto_delay {
            self.delay(REPLY_DELAY_TICKS);
        }

        debug!(target: "sio::reply", "Device {:02X} > Complete", self.iface.active_device_id);
        match self.bus.accel.is_some() {
            true => self.iface.steps.push_back(Step::AccelSendComplete),
            false => self.send_data(&[COMPLETE], false),
        }
    }

    pub fn send_error(&mut self, auto_delay: bool) {
        if !self.iface.command_active {
            return self.ignore("Error");
        }

        if auto_delay {
            self.delay(REPLY_DELAY_TICKS);
        }

        debug!(target: "sio::reply", "Device {:02X} > Error", self.iface.active_device_id);
        match self.bus.accel.is_some() {
            true => self.iface.steps.push_back(Step::AccelSendError),
            false => self.send_data(&[ERROR], false),
        }
    }

    /// Receives `len` bytes, reported through `on_receive_complete` with `id`.
    ///
    /// With `auto_protocol` a checksum byte is expected too, and answered: ACK if it
    /// matches, otherwise NAK and the command ends.
    pub fn receive_data(&mut self, id: u32, len: u32, auto_protocol: bool) {
        if !self.iface.command_active {
            return self.ignore("receive");
        }

        let len = len + auto_protocol as u32;
        if let Err(err) = self.iface.buffer.append_zeroed(len as usize) {
            return self.fault(err);
        }

        self.iface.steps.push_back(match auto_protocol {
            true => Step::ReceiveAutoProtocol { len, id },
            false => Step::Receive { len, id },
        });

        if auto_protocol {
            self.delay(RECEIVE_REPLY_DELAY_TICKS);
            self.send_ack();
        }

        self.execute_next_step();
    }

    pub fn set_transfer_rate(&mut self, cycles_per_bit: u32, cycles_per_byte: u32) {
        if !self.iface.command_active {
            return self.ignore("rate change");
        }

        self.iface.steps.push_back(Step::SetTransferRate { cycles_per_bit, cycles_per_byte });
        self.iface.command_queue_cycles_per_byte = cycles_per_byte;
        self.execute_next_step();
    }

    pub fn set_synchronous_transmit(&mut self, enable: bool) {
        if !self.iface.command_active {
            return self.ignore("sync change");
        }

        self.iface.steps.push_back(Step::SetSynchronousTransmit { enable });
        self.execute_next_step();
    }

    pub fn delay(&mut self, ticks: u32) {
        if !self.iface.command_active {
            return self.ignore("delay");
        }

        if ticks == 0 {
            return;
        }

        self.iface.steps.push_back(Step::Delay { ticks });
        self.iface.command_queue_time += ticks as u64;
        self.execute_next_step();
    }

    /// Queues a call to `on_fence` with `id` once everything before it has run.
    pub fn insert_fence(&mut self, id: u32) {
        if !self.iface.command_active {
            return self.ignore("fence");
        }

        self.iface.steps.push_back(Step::Fence { id });
    }

    /// Drops every step not yet started.
    pub fn flush_queue(&mut self) {
        self.iface.steps.clear();
    }

    pub fn end_command(&mut self) {
        if !self.iface.command_active {
            return self.ignore("end");
        }

        self.iface.steps.push_back(Step::EndCommand);
    }

    /// A whole command in one go: ACK, Complete or Error, then `data` with its checksum.
    pub fn handle_command(&mut self, data: &[u8], succeeded: bool) {
        self.begin_command();
        self.send_ack();

        match succeeded {
            true => self.send_complete(true),
            false => self.send_error(true),
        }

        if !data.is_empty() {
            self.send_data(data, true);
        }

        self.end_command();
    }

    ////////////////////////////////////////////////////////////////////////////

    pub fn save_active_command_state(&self) -> Option<SavedActiveCommand> {
        self.iface.save_active_command(&self.bus.scheduler)
    }

    /// Replaces whatever this interface is doing with `state`. On error the interface
    /// is left idle.
    pub fn load_active_command_state(
        &mut self,
        state: &SavedActiveCommand,
    ) -> Result<(), SaveStateError> {
        let result = self.restore_active_command(state);
        if result.is_err() {
            self.cancel_command();
            self.iface.reset_transfer_params();
            self.iface.update_transfer_rate_derived_values();
        }
        result
    }

    fn restore_active_command(&mut self, state: &SavedActiveCommand) -> Result<(), SaveStateError> {
        self.cancel_command();
        self.iface.reset_transfer_params();

        if state.transfer_cycles_per_byte != 0 {
            self.iface.transfer_cycles_per_byte = state.transfer_cycles_per_byte;
        }

        if state.transfer_cycles_per_bit != 0 {
            self.iface.transfer_cycles_per_bit = state.transfer_cycles_per_bit;
        }

        self.iface.command_active = true;
        self.iface.active_device_id = state.device_id;
        self.iface.transmit_synchronous = state.transmit_synchronous;
        self.iface.transfer_error = state.transfer_error;
        self.iface.transfer_send = false;

        let t64 = self.bus.scheduler.tick64();
        self.iface.transfer_start_time =
            (t64 as u32).wrapping_add(state.transfer_start_time as u32);
        self.iface.command_queue_time = t64.wrapping_add(state.queue_time as u64);
        self.iface.command_queue_cycles_per_byte = state.queue_cycles_per_byte;
        self.iface.command_frame_end_time = t64.wrapping_add(state.command_frame_end_time as u64);
        self.iface.command_deassert_time = t64.wrapping_add(state.command_deassert_time as u64);

        self.iface.buffer.clear();

        if let Some(saved) = &state.current_step {
            let step = saved.to_step()?;
            let len = step.transfer_len();
            self.iface.current_step = Some(step);

            if step.is_receive_step() {
                self.iface.buffer.restore(&saved.transfer_data);
                self.iface.buffer.append_zeroed(len - saved.transfer_data.len())?;
                self.iface.buffer.set_end(len);
                self.bus.begin_receive(self.id);
            } else if step.is_send_step() {
                self.iface.buffer.restore(&saved.transfer_data);
                self.iface.buffer.set_end(len);
                self.iface.transfer_send = true;
                self.iface.transfer_event =
                    Some(self.bus.scheduler.set_event(state.step_delay, self.id, EventKind::Send));
                self.bus.begin_send(self.id);
            } else if step.is_delay() {
                match state.step_delay {
                    0 => self.iface.current_step = None,
                    ticks => {
                        let handle = self.bus.scheduler.set_event(ticks, self.id, EventKind::Delay);
                        self.iface.delay_event = Some(handle);
                    }
                }
            }
        }

        if !self.iface.buffer.set_index(state.transfer_index as usize) {
            return Err(SaveStateError::TransferIndex {
                index: state.transfer_index,
                end: self.iface.buffer.end() as u32,
            });
        }

        for saved in &state.steps {
            let step = saved.to_step()?;
            if step.is_send_step() {
                self.iface.buffer.append(&saved.transfer_data)?;
            } else if step.is_receive_step() {
                self.iface.buffer.append_zeroed(step.transfer_len())?;
            }
            self.iface.steps.push_back(step);
        }

        let cycles_per_bit = self.iface.transfer_cycles_per_bit;
        let cycles_per_byte = self.iface.transfer_cycles_per_byte;
        if cycles_per_bit > MAX_SAVED_CYCLES_PER_BIT
            || cycles_per_byte > MAX_SAVED_CYCLES_PER_BYTE
            || cycles_per_byte < cycles_per_bit * 8
        {
            return Err(SaveStateError::TransferRate { cycles_per_bit, cycles_per_byte });
        }

        self.iface.active_device_disk = is_disk_device(self.iface.active_device_id);
        self.iface.update_transfer_rate_derived_values();
        self.bus.add_active(self.id);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Drops the active command, if any. The device hears about it through
    /// `on_abort_command`.
    pub(crate) fn cancel_command(&mut self) {
        if !self.iface.command_active {
            return;
        }

        let device = self.iface.active_device_id;
        debug!(target: "sio::cmd", "Cancelling command on device {device:02X}");

        self.iface.active_device_id = 0;
        self.reset_transfer();

        self.iface.events.clear();
        self.iface.events.push_back(DeviceEvent::Abort);

        self.iface.steps.clear();
        self.iface.current_step = None;
        self.bus.remove_active(self.id);
        self.iface.command_active = false;
    }

    /// A byte from the computer. Returns whether the port may burst.
    pub(crate) fn on_receive(&mut self, val: u8, cycles_per_bit: u32) -> bool {
        if self.iface.buffer.at_end() || self.iface.transfer_send {
            self.bus.end_receive(self.id);
            return false;
        }

        if cycles_per_bit < self.iface.transfer_cycles_per_bit_recv_min
            || cycles_per_bit > self.iface.transfer_cycles_per_bit_recv_max
        {
            self.iface.transfer_error = true;
        }

        // Framing errors are ignored; drives don't check the stop bit either.
        self.iface.buffer.store_in(val);

        if self.iface.buffer.at_end() {
            let elapsed = self.bus.scheduler.tick().wrapping_sub(self.iface.transfer_start_time);
            self.iface.command_queue_time += elapsed as u64;

            if !self.complete_receive() {
                return false;
            }
        }

        self.burst_allowed()
    }

    /// Hands the finished receive to the device. False if the command was NAKed.
    fn complete_receive(&mut self) -> bool {
        let Some(step) = self.iface.current_step else {
            return false;
        };

        let data = self.iface.buffer.current().to_vec();
        let checksum_ok = !self.iface.transfer_error && (data.is_empty() || verify_checksum(&data));
        self.iface.buffer.complete_step();

        let (Step::Receive { id, .. } | Step::ReceiveAutoProtocol { id, .. }) = step else {
            return false;
        };

        if step.is_receive_auto_protocol() {
            if !checksum_ok {
                let device = self.iface.active_device_id;
                debug!(target: "sio::steps", "Device {device:02X}: bad data frame, NAKing");
                self.iface.steps.clear();
                self.iface.current_step = None;
                self.bus.end_receive(self.id);

                self.delay(RECEIVE_REPLY_DELAY_TICKS);
                self.send_nak();
                self.end_command();
                self.execute_next_step();
                return false;
            }

            let len = data.len().saturating_sub(1);
            let data = data[..len].to_vec();
            self.push_event(DeviceEvent::ReceiveComplete { id, data, checksum_ok: true });
        } else {
            self.push_event(DeviceEvent::ReceiveComplete { id, data, checksum_ok });
        }

        self.bus.end_receive(self.id);
        self.iface.current_step = None;
        self.execute_next_step();
        true
    }

    /// The computer's serial port is ready for more input. Returns false once this
    /// interface has nothing more to send.
    pub(crate) fn on_send_ready(&mut self) -> bool {
        let Some(handle) = self.iface.transfer_event else {
            return false;
        };

        if !self.iface.transfer_send {
            return false;
        }

        let buf = &self.iface.buffer;
        if buf.index() - buf.start() < BURST_MIN_BYTES as usize {
            return true;
        }

        let existing = self.bus.scheduler.ticks_to_event(handle);
        if existing > BURST_BYTE_DELAY {
            // The time cut from this byte goes onto the next one, so don't count the
            // last cut twice.
            let iface = &mut *self.iface;
            iface.burst_offset = existing - BURST_BYTE_DELAY;
            iface.accel_time_skew = iface
                .accel_time_skew
                .wrapping_sub(iface.last_burst_offset)
                .wrapping_add(iface.burst_offset);

            self.bus.scheduler.unset_event(&mut self.iface.transfer_event);
            let handle = self.bus.scheduler.set_event(BURST_BYTE_DELAY, self.id, EventKind::Send);
            self.iface.transfer_event = Some(handle);
        }

        true
    }

    pub(crate) fn on_event(&mut self, handle: EventHandle, kind: EventKind) {
        match kind {
            EventKind::Delay => {
                if self.iface.delay_event != Some(handle) {
                    return;
                }

                self.iface.delay_event = None;
                self.iface.current_step = None;
                self.execute_next_step();
            }
            EventKind::Send => {
                if self.iface.transfer_event != Some(handle) {
                    return;
                }

                self.on_send_event();
            }
        }
    }

    fn on_send_event(&mut self) {
        self.iface.transfer_event = None;

        match self.iface.buffer.next_out() {
            Some(val) => {
                let byte = SerialByte {
                    value: val,
                    cycles_per_bit: self.iface.transfer_cycles_per_bit,
                    time: self.bus.scheduler.tick64(),
                    simulate_input: true,
                    allow_burst: self.burst_allowed(),
                    synchronous: self.iface.transmit_synchronous,
                    framing_error: false,
                };

                let device = self.iface.active_device_id;
                trace!(target: "sio::steps", "Device {device:02X} > {val:02X}");
                self.bus.port.receive_byte(byte);

                let delay = self.iface.transfer_cycles_per_byte + self.iface.burst_offset;
                let handle = self.bus.scheduler.set_event(delay, self.id, EventKind::Send);
                self.iface.transfer_event = Some(handle);
                self.iface.last_burst_offset = self.iface.burst_offset;
                self.iface.burst_offset = 0;
            }
            None => {
                debug_assert!(
                    !self.iface.current_step.is_some_and(|s| s.is_send_auto_protocol())
                        || verify_checksum(self.iface.buffer.current())
                );

                self.iface.buffer.complete_step();
                self.iface.current_step = None;
                self.bus.end_send(self.id);
                self.execute_next_step();
            }
        }
    }

    /// Runs steps until one has to wait for bus time, or a callback is owed to the
    /// device.
    pub(crate) fn execute_next_step(&mut self) {
        while self.iface.current_step.is_none() && self.iface.events.is_empty() {
            let Some(step) = self.iface.steps.pop_front() else {
                break;
            };
            self.iface.current_step = Some(step);

            let accel = self.bus.accel.is_some();
            match step {
                Step::Send { len } | Step::SendAutoProtocol { len } => {
                    if !accel {
                        trace!(target: "sio::steps", "Sending {len} bytes");
                    }

                    self.iface.transfer_send = true;
                    self.iface.buffer.begin_step(len as usize);
                    self.iface.burst_offset = 0;
                    self.iface.last_burst_offset = 0;

                    match accel {
                        true => self.accel_send(step),
                        false => {
                            self.bus.begin_send(self.id);
                            self.on_send_event();
                        }
                    }
                }

                Step::Receive { len, .. } | Step::ReceiveAutoProtocol { len, .. } => {
                    if !accel {
                        trace!(target: "sio::steps", "Receiving {len} bytes");
                    }

                    self.iface.transfer_send = false;
                    self.iface.transfer_error = false;
                    self.iface.buffer.begin_step(len as usize);
                    self.iface.update_transfer_rate_derived_values();

                    if accel {
                        self.accel_receive(step);
                    } else if len == 0 {
                        self.complete_receive();
                    } else {
                        self.bus.begin_receive(self.id);
                        self.iface.transfer_start_time = self.bus.scheduler.tick();
                    }
                }

                Step::SetTransferRate { cycles_per_bit, cycles_per_byte } => {
                    self.iface.transfer_cycles_per_bit = cycles_per_bit;
                    self.iface.transfer_cycles_per_byte = cycles_per_byte;
                    self.iface.update_transfer_rate_derived_values();
                    self.iface.current_step = None;
                }

                Step::SetSynchronousTransmit { enable } => {
                    self.iface.transmit_synchronous = enable;
                    self.iface.current_step = None;
                }

                Step::Delay { ticks } => {
                    if accel {
                        self.add_accel_skew(ticks);
                        self.iface.current_step = None;
                    } else {
                        trace!(target: "sio::steps", "Delaying for {ticks} ticks");
                        self.bus.scheduler.unset_event(&mut self.iface.delay_event);
                        let handle = self.bus.scheduler.set_event(ticks, self.id, EventKind::Delay);
                        self.iface.delay_event = Some(handle);
                    }
                }

                Step::Fence { id } => {
                    self.iface.current_step = None;
                    self.push_event(DeviceEvent::Fence(id));
                }

                Step::EndCommand => {
                    if !accel {
                        trace!(target: "sio::steps", "Ending command");
                    }
                    self.finish_command();
                    return;
                }

                Step::AccelSendAck | Step::AccelSendComplete => {
                    self.add_accel_skew(self.iface.transfer_cycles_per_byte);
                    self.iface.current_step = None;
                }

                Step::AccelSendNak => {
                    self.set_accel_status(STATUS_NAK);
                    self.add_accel_skew(self.iface.transfer_cycles_per_byte);
                    self.iface.current_step = None;
                }

                Step::AccelSendError => {
                    self.set_accel_status(STATUS_DEVICE_ERROR);
                    self.add_accel_skew(self.iface.transfer_cycles_per_byte);
                    self.iface.current_step = None;
                }
            }
        }
    }

    fn accel_send(&mut self, step: Step) {
        let len = step.transfer_len() - step.is_send_auto_protocol() as usize;
        let cycles_per_byte = self.iface.transfer_cycles_per_byte;

        if let Some(accel) = self.bus.accel.as_mut().filter(|a| a.request.is_read()) {
            let data = self.iface.buffer.current();
            let min_len = len.min(accel.request.length as usize);

            if let Some(status) = accel.store_read(data, len) {
                accel.status = status;
            }

            let skew = (min_len as u32 + 1).wrapping_mul(cycles_per_byte);
            self.add_accel_skew(skew);
        }

        self.iface.buffer.complete_step();
        self.iface.current_step = None;
    }

    fn accel_receive(&mut self, step: Step) {
        let (Step::Receive { id, .. } | Step::ReceiveAutoProtocol { id, .. }) = step else {
            return;
        };

        let len = step.transfer_len() - step.is_receive_auto_protocol() as usize;
        let bit_cycles = self.iface.transfer_cycles_per_bit * BITS_PER_BYTE;

        let Some(accel) = self.bus.accel.as_ref() else {
            return;
        };

        let req_len = match accel.request.is_write() {
            true => accel.request.length as usize,
            false => 0,
        };
        let min_len = len.min(req_len);

        let dst = self.iface.buffer.current_mut();
        for (offset, slot) in dst.iter_mut().enumerate().take(len) {
            *slot = match offset < min_len {
                true => accel.read_buffer(offset),
                false => 0,
            };
        }

        // Short of what the device wanted reads as a broken checksum; longer means the
        // byte after the data is the caller's checksum.
        let data = dst[..len].to_vec();
        let checksum_ok = if req_len < len {
            false
        } else if req_len > len {
            accel.read_buffer(min_len) == compute_checksum(&data[..min_len])
        } else {
            true
        };

        self.add_accel_skew((min_len as u32 + 1).wrapping_mul(bit_cycles));
        self.push_event(DeviceEvent::ReceiveComplete { id, data, checksum_ok });

        self.iface.buffer.complete_step();
        self.iface.current_step = None;
    }

    fn finish_command(&mut self) {
        self.iface.command_active = false;
        self.iface.current_step = None;
        self.iface.steps.clear();

        // Hand the allocations back for the next command.
        let mut used = mem::take(&mut self.iface.buffer).into_vec();
        used.clear();
        self.bus.cached_buffer = used;
        mem::swap(&mut self.iface.steps, &mut self.bus.cached_steps);

        self.bus.remove_active(self.id);
    }

    ////////////////////////////////////////////////////////////////////////////

    fn reset_transfer(&mut self) {
        self.iface.buffer.reset_cursors();
        self.iface.transfer_send = false;

        self.bus.scheduler.unset_event(&mut self.iface.delay_event);
        self.bus.scheduler.unset_event(&mut self.iface.transfer_event);

        self.bus.end_receive(self.id);
        self.bus.end_send(self.id);
    }

    fn burst_allowed(&self) -> bool {
        self.bus.burst_allowed(self.iface.active_device_disk)
    }

    fn push_event(&mut self, event: DeviceEvent) {
        self.iface.events.push_back(event);
    }

    fn add_accel_skew(&mut self, cycles: u32) {
        self.iface.accel_time_skew = self.iface.accel_time_skew.wrapping_add(cycles);
        self.bus.time_skew += cycles as u64;
    }

    fn set_accel_status(&mut self, status: u8) {
        if let Some(accel) = self.bus.accel.as_mut() {
            accel.status = status;
        }
    }

    fn ignore(&mut self, operation: &'static str) {
        warn!(target: "sio::steps", "{:?}: ignoring {operation} with no active command", self.id);
        self.bus.faults.push(SioError::NoActiveCommand { operation });
    }

    fn fault(&mut self, err: SioError) {
        error!(target: "sio::cmd", "Device {:02X}: {err}", self.iface.active_device_id);
        self.bus.faults.push(err);
        self.cancel_command();
    }
}
