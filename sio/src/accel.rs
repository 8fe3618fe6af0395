use common::checksum::compute_checksum;
use common::command::DeviceRequest;
use common::constants::*;

use crate::host::SioHost;

/// Bookkeeping for one accelerated request while it's offered to devices.
///
/// Steps run against a copy of the caller's buffer; memory writes are recorded and
/// only land in the host if a device ends up handling the request.
#[derive(Debug, Clone)]
pub(crate) struct AccelState {
    pub request: DeviceRequest,
    pub address: u16,
    pub status: u8,
    window: Vec<u8>,
    writes: Vec<(u16, u8)>,
}

impl AccelState {
    pub fn new(request: DeviceRequest, address: u16, host: &dyn SioHost) -> Self {
        let window = (0..request.length as usize)
            .map(|offset| host.mem_read_byte(address.wrapping_add(offset as u16)))
            .collect();

        AccelState { request, address, status: STATUS_SUCCESS, window, writes: Vec::new() }
    }

    pub fn read_buffer(&self, offset: usize) -> u8 {
        self.window.get(offset).copied().unwrap_or(0)
    }

    pub fn write_buffer(&mut self, offset: usize, val: u8) {
        if let Some(slot) = self.window.get_mut(offset) {
            *slot = val;
        }
        self.writes.push((self.address.wrapping_add(offset as u16), val));
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        self.writes.push((addr, val));
    }

    /// Leaves a device to memory transfer the way the OS does: data in the caller's
    /// buffer, the checksum it computed in CHKSUM and BUFRLO/HI one past the end.
    /// Returns the status the transfer earns, if it isn't a success.
    pub fn store_read(&mut self, data: &[u8], len: usize) -> Option<u8> {
        let req_len = self.request.length as usize;
        let min_len = len.min(req_len);

        for (offset, &val) in data[..min_len].iter().enumerate() {
            self.write_buffer(offset, val);
        }

        let chk = compute_checksum(&data[..min_len]);
        let end = self.address.wrapping_add(min_len as u16);
        self.write(CHKSUM, chk);
        self.write(BUFRLO, end as u8);
        self.write(BUFRHI, (end >> 8) as u8);

        if len < req_len {
            Some(STATUS_TIMEOUT)
        } else if len > req_len && data.get(req_len).is_some_and(|&sent| sent != chk) {
            Some(STATUS_CHECKSUM)
        } else {
            None
        }
    }

    /// Applies the recorded writes, in order.
    pub fn commit(&self, host: &mut dyn SioHost) {
        for &(addr, val) in &self.writes {
            host.mem_write_byte(addr, val);
        }
    }
}
