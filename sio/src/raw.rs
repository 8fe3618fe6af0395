use crate::device::SioRawDevice;
use crate::manager::BusState;
use crate::port::{SerialByte, SioPort};

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawDeviceId(pub(crate) usize);

/// A list that can be changed while it's being walked. While anyone is inside
/// (see [`RawDeviceRegistry::enter`]), additions wait on the side and removals just
/// blank their slot; the outermost [`RawDeviceRegistry::leave`] tidies up.
#[derive(Debug)]
pub struct RawDeviceRegistry<T> {
    live: Vec<Option<T>>,
    pending: Vec<T>,
    busy: u32,
}

impl<T> Default for RawDeviceRegistry<T> {
    fn default() -> Self {
        RawDeviceRegistry { live: Vec::new(), pending: Vec::new(), busy: 0 }
    }
}

impl<T: Copy + PartialEq> RawDeviceRegistry<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// False if `item` is already registered.
    pub fn add(&mut self, item: T) -> bool {
        if self.contains(item) {
            return false;
        }

        match self.busy {
            0 => self.live.push(Some(item)),
            _ => self.pending.push(item),
        }
        true
    }

    pub fn remove(&mut self, item: T) -> bool {
        if let Some(pos) = self.pending.iter().position(|&p| p == item) {
            self.pending.remove(pos);
            return true;
        }

        let Some(pos) = self.live.iter().position(|&p| p == Some(item)) else {
            return false;
        };

        match self.busy {
            0 => {
                self.live.remove(pos);
            }
            _ => self.live[pos] = None,
        }
        true
    }

    pub fn contains(&self, item: T) -> bool {
        self.live.contains(&Some(item)) || self.pending.contains(&item)
    }

    pub fn enter(&mut self) {
        self.busy += 1;
    }

    pub fn leave(&mut self) {
        debug_assert!(self.busy > 0);
        self.busy = self.busy.saturating_sub(1);

        if self.busy == 0 {
            self.live.retain(Option::is_some);
            self.live.extend(self.pending.drain(..).map(Some));
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }

    /// Slots in the live list, blanked ones included. Fixed while busy.
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, idx: usize) -> Option<T> {
        self.live.get(idx).copied().flatten()
    }

    /// Live entries, skipping blanked ones.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.live.iter().flatten().copied()
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExternalClock {
    device: RawDeviceId,
    time_base: u32,
    period: u32,
}

/// Raw devices and the bus lines they drive.
#[derive(Default)]
pub(crate) struct RawDevices {
    pub registry: RawDeviceRegistry<RawDeviceId>,

    // Indexed by ID. A device is out of its slot while it's being called.
    arena: Vec<Option<Box<dyn SioRawDevice>>>,

    // Sorted, so the same set always looks the same.
    interrupt_active: Vec<RawDeviceId>,
    proceed_active: Vec<RawDeviceId>,
    bi_clock_notify: Vec<RawDeviceId>,

    // Fastest first; only the first one drives the port.
    external_clocks: Vec<ExternalClock>,
}

impl RawDevices {
    pub fn add(&mut self, device: Box<dyn SioRawDevice>) -> RawDeviceId {
        let id = RawDeviceId(self.arena.len());
        self.arena.push(Some(device));
        self.registry.add(id);
        debug!(target: "sio::raw", "Added raw device {id:?}");
        id
    }

    /// Unregisters `id`, releasing any lines it held. The device itself comes back
    /// unless it's in the middle of a callback, in which case it's dropped afterward.
    pub fn remove(
        &mut self,
        id: RawDeviceId,
        port: &dyn SioPort,
        now: u32,
    ) -> Option<Box<dyn SioRawDevice>> {
        self.set_interrupt(id, false, port);
        self.set_proceed(id, false, port);
        self.set_bi_clock_notify(id, false, port);
        self.set_external_clock(id, 0, 0, port, now);

        if !self.registry.remove(id) {
            return None;
        }

        debug!(target: "sio::raw", "Removed raw device {id:?}");
        self.arena.get_mut(id.0).and_then(Option::take)
    }

    pub fn take(&mut self, id: RawDeviceId) -> Option<Box<dyn SioRawDevice>> {
        self.arena.get_mut(id.0).and_then(Option::take)
    }

    pub fn restore(&mut self, id: RawDeviceId, device: Box<dyn SioRawDevice>) {
        if !self.registry.contains(id) {
            return;
        }

        if let Some(slot) = self.arena.get_mut(id.0) {
            *slot = Some(device);
        }
    }

    pub fn bi_clock_notify_list(&self) -> Vec<RawDeviceId> {
        self.bi_clock_notify.clone()
    }

    pub fn set_interrupt(&mut self, id: RawDeviceId, asserted: bool, port: &dyn SioPort) {
        if set_membership(&mut self.interrupt_active, id, asserted) {
            port.set_interrupt_line(!self.interrupt_active.is_empty());
        }
    }

    pub fn set_proceed(&mut self, id: RawDeviceId, asserted: bool, port: &dyn SioPort) {
        if set_membership(&mut self.proceed_active, id, asserted) {
            port.set_proceed_line(!self.proceed_active.is_empty());
        }
    }

    pub fn set_bi_clock_notify(&mut self, id: RawDeviceId, enabled: bool, port: &dyn SioPort) {
        if set_membership(&mut self.bi_clock_notify, id, enabled) {
            port.set_bi_clock_notify(!self.bi_clock_notify.is_empty());
        }
    }

    pub fn is_interrupt_asserted(&self) -> bool {
        !self.interrupt_active.is_empty()
    }

    pub fn is_proceed_asserted(&self) -> bool {
        !self.proceed_active.is_empty()
    }

    /// A period of 0 removes the device's clock.
    pub fn set_external_clock(
        &mut self,
        id: RawDeviceId,
        initial_offset: u32,
        period: u32,
        port: &dyn SioPort,
        now: u32,
    ) {
        let old_front = self.external_clocks.first().copied();
        let existing = self.external_clocks.iter().position(|c| c.device == id);

        if period != 0 {
            let time_base = initial_offset.wrapping_add(now);
            let entry = ExternalClock { device: id, time_base, period };

            if let Some(pos) = existing {
                if self.external_clocks[pos] == entry {
                    return;
                }
                self.external_clocks.remove(pos);
            }

            let pos = self.external_clocks.partition_point(|c| c.period < period);
            self.external_clocks.insert(pos, entry);
        } else if let Some(pos) = existing {
            self.external_clocks.remove(pos);
        }

        let new_front = self.external_clocks.first().copied();
        if new_front != old_front {
            match new_front {
                Some(clk) => port.set_external_clock(clk.time_base, clk.period),
                None => port.set_external_clock(0, 0),
            }
        }
    }
}

// Adds or removes `id` from a sorted set. True if the set went between empty and not.
fn set_membership(set: &mut Vec<RawDeviceId>, id: RawDeviceId, present: bool) -> bool {
    let was_empty = set.is_empty();
    match (set.binary_search(&id), present) {
        (Err(pos), true) => set.insert(pos, id),
        (Ok(pos), false) => {
            set.remove(pos);
        }
        _ => return false,
    }
    was_empty != set.is_empty()
}

////////////////////////////////////////////////////////////////////////////////

/// What a raw device can do to the bus from inside a callback.
pub struct RawBus<'a> {
    id: RawDeviceId,
    state: &'a mut BusState,
    raw: &'a mut RawDevices,
}

impl<'a> RawBus<'a> {
    pub(crate) fn new(id: RawDeviceId, state: &'a mut BusState, raw: &'a mut RawDevices) -> Self {
        RawBus { id, state, raw }
    }

    pub fn id(&self) -> RawDeviceId {
        self.id
    }

    pub fn tick64(&self) -> u64 {
        self.state.scheduler.tick64()
    }

    /// Puts a byte on the bus for the computer, bypassing the command machinery.
    pub fn send_raw_byte(
        &mut self,
        val: u8,
        cycles_per_bit: u32,
        synchronous: bool,
        framing_error: bool,
        simulate_input: bool,
    ) {
        self.state.port.receive_byte(SerialByte {
            value: val,
            cycles_per_bit,
            time: self.state.scheduler.tick64(),
            simulate_input,
            allow_burst: false,
            synchronous,
            framing_error,
        });
    }

    pub fn set_raw_input(&mut self, level: bool) {
        self.state.port.set_data_line(level);
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

    pub fn is_force_break_asserted(&self) -> bool {
        self.state.port.is_force_break()
    }

    pub fn cycles_per_bit_recv(&self) -> u32 {
        self.state.port.cycles_per_bit_recv()
    }

    pub fn cycles_per_bit_send(&self) -> u32 {
        self.state.port.cycles_per_bit_send()
    }

    pub fn recv_reset_counter(&self) -> u32 {
        self.state.port.recv_reset_counter()
    }

    pub fn cycles_per_bit_bi_clock(&self) -> u32 {
        self.state.cycles_per_bit_bi_clock()
    }

    pub fn set_interrupt(&mut self, asserted: bool) {
        self.raw.set_interrupt(self.id, asserted, &*self.state.port);
    }

    pub fn set_proceed(&mut self, asserted: bool) {
        self.raw.set_proceed(self.id, asserted, &*self.state.port);
    }

    pub fn set_bi_clock_notify(&mut self, enabled: bool) {
        self.raw.set_bi_clock_notify(self.id, enabled, &*self.state.port);
    }

    /// Clocks the port's serial input from this device, `initial_offset` cycles from
    /// now. A period of 0 stops it.
    pub fn set_external_clock(&mut self, initial_offset: u32, period: u32) {
        let now = self.state.scheduler.tick();
        self.raw.set_external_clock(self.id, initial_offset, period, &*self.state.port, now);
    }

    /// Registers another raw device. If a notification is under way it won't hear
    /// about it.
    pub fn add_device(&mut self, device: Box<dyn SioRawDevice>) -> RawDeviceId {
        self.raw.add(device)
    }

    /// Unregisters a raw device, possibly the caller. Returns false if it wasn't
    /// registered.
    pub fn remove_device(&mut self, id: RawDeviceId) -> bool {
        let now = self.state.scheduler.tick();
        let was_registered = self.raw.registry.contains(id);
        drop(self.raw.remove(id, &*self.state.port, now));
        was_registered
    }
}
