use crate::error::SioError;

use common::constants::MAX_TRANSFER_SIZE;

/// Bytes queued for, or received from, the bus during one command.
///
/// Each send or receive step owns the span `start..end`; `index` is how far into it
/// the step has got. Queued steps append past `end`. Always
/// `start <= index <= end <= len`.
#[derive(Debug, Default)]
pub struct TransferBuffer {
    data: Vec<u8>,
    start: usize,
    index: usize,
    end: usize,
}

impl TransferBuffer {
    pub const CAPACITY: usize = MAX_TRANSFER_SIZE;

    pub fn new() -> Self {
        Default::default()
    }

    /// Reuses `data`'s allocation; its contents are discarded.
    pub fn from_vec(mut data: Vec<u8>) -> Self {
        data.clear();
        TransferBuffer { data, start: 0, index: 0, end: 0 }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn reset_cursors(&mut self) {
        self.start = 0;
        self.index = 0;
        self.end = 0;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.reset_cursors();
    }

    /// Makes room for `len` more bytes, dropping whatever already went over the bus if
    /// that's what it takes.
    pub fn reserve(&mut self, len: usize) -> Result<(), SioError> {
        if Self::CAPACITY - self.data.len() >= len {
            return Ok(());
        }

        self.compact();

        let available = Self::CAPACITY - self.data.len();
        if available < len {
            return Err(SioError::TransferBufferFull { requested: len, available });
        }
        Ok(())
    }

    /// Discards bytes before the current step.
    pub fn compact(&mut self) {
        let base = self.start;
        if base == 0 {
            return;
        }

        self.data.drain(..base);
        self.start = 0;
        self.index -= base;
        self.end -= base;
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), SioError> {
        self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_zeroed(&mut self, len: usize) -> Result<(), SioError> {
        self.reserve(len)?;
        self.data.resize(self.data.len() + len, 0);
        Ok(())
    }

    /// Starts a step covering the next `len` bytes.
    pub fn begin_step(&mut self, len: usize) {
        self.start = self.index;
        self.end = (self.start + len).min(self.data.len());
    }

    /// Marks the current step done.
    pub fn complete_step(&mut self) {
        self.index = self.end;
        self.start = self.end;
    }

    pub fn at_end(&self) -> bool {
        self.index >= self.end
    }

    /// Next byte of a send step.
    pub fn next_out(&mut self) -> Option<u8> {
        if self.at_end() {
            return None;
        }

        let val = self.data[self.index];
        self.index += 1;
        Some(val)
    }

    /// Stores the next byte of a receive step. Returns false if the step was already full.
    pub fn store_in(&mut self, val: u8) -> bool {
        if self.at_end() {
            return false;
        }

        self.data[self.index] = val;
        self.index += 1;
        true
    }

    /// The whole span of the current step.
    pub fn current(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn current_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }

    /// The part of the current step already transferred.
    pub fn transferred(&self) -> &[u8] {
        &self.data[self.start..self.index]
    }

    /// Bytes after the current step, i.e. those owned by queued steps.
    pub fn queued(&self) -> &[u8] {
        &self.data[self.end..]
    }

    /// Replaces the contents outright, with the cursors at the origin.
    pub(crate) fn restore(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.reset_cursors();
    }

    pub(crate) fn set_end(&mut self, end: usize) {
        self.end = end.min(self.data.len());
        self.start = self.start.min(self.end);
        self.index = self.index.min(self.end);
    }

    /// Moves `index` within the current step. False if that's past its end.
    pub(crate) fn set_index(&mut self, index: usize) -> bool {
        if index < self.start || index > self.end {
            return false;
        }
        self.index = index;
        true
    }
}
