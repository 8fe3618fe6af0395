use crate::interface::InterfaceId;

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A `Delay` step ran out.
    Delay,

    /// Time to put the next byte of a `Send` step on the bus.
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub handle: EventHandle,
    pub target: InterfaceId,
    pub kind: EventKind,
    deadline: u64,
}

impl Event {
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

// Deadlines compare by signed distance, so the clock may wrap.
fn is_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// A single threaded cycle clock with one-shot events.
///
/// Events are plain data; whoever advances the clock pops them with
/// [`Scheduler::pop_due`] and routes them to their target.
#[derive(Debug, Default)]
pub struct Scheduler {
    tick: u64,
    next_handle: u64,
    events: Vec<Event>,
}

impl Scheduler {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn tick64(&self) -> u64 {
        self.tick
    }

    pub fn tick(&self) -> u32 {
        self.tick as u32
    }

    /// Schedules `kind` for `target`, `delay` cycles from now.
    pub fn set_event(&mut self, delay: u32, target: InterfaceId, kind: EventKind) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;

        let deadline = self.tick.wrapping_add(delay as u64);
        trace!(target: "sio::steps", "Scheduling {kind:?} for {target:?} at {deadline}");
        self.events.push(Event { handle, target, kind, deadline });
        handle
    }

    /// Cancels the event in `handle`, if any, and clears it.
    pub fn unset_event(&mut self, handle: &mut Option<EventHandle>) {
        if let Some(handle) = handle.take() {
            self.events.retain(|ev| ev.handle != handle);
        }
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.events.iter().any(|ev| ev.handle == handle)
    }

    /// Cycles until `handle` fires; 0 if it isn't pending.
    pub fn ticks_to_event(&self, handle: EventHandle) -> u32 {
        self.events
            .iter()
            .find(|ev| ev.handle == handle)
            .map(|ev| ev.deadline.wrapping_sub(self.tick) as u32)
            .unwrap_or(0)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.earliest().map(|idx| self.events[idx].deadline)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Removes the earliest event due at or before `limit`, moving the clock up to it.
    /// Ties go to whichever was scheduled first.
    pub fn pop_due(&mut self, limit: u64) -> Option<Event> {
        let idx = self.earliest()?;
        if is_before(limit, self.events[idx].deadline) {
            return None;
        }

        let ev = self.events.remove(idx);
        if is_before(self.tick, ev.deadline) {
            self.tick = ev.deadline;
        }
        Some(ev)
    }

    /// Moves the clock to `tick`. Any events due by then must already have been popped.
    pub fn advance_to(&mut self, tick: u64) {
        debug_assert!(self.next_deadline().is_none_or(|d| is_before(tick, d)));
        if is_before(self.tick, tick) {
            self.tick = tick;
        }
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn earliest(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, ev) in self.events.iter().enumerate() {
            match best {
                Some(b) if !is_before(ev.deadline, self.events[b].deadline) => {}
                _ => best = Some(idx),
            }
        }
        best
    }
}
