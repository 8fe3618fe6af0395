use crate::command::SioRequest;
use crate::constants::DDEVIC;

use bytemuck::{Pod, Zeroable};

/// The device control block at DDEVIC, as the kernel lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Dcb {
    pub ddevic: u8,
    pub dunit: u8,
    pub dcomnd: u8,
    pub dstats: u8,
    pub dbuf: [u8; 2],
    pub dtimlo: u8,
    pub dunuse: u8,
    pub dbyt: [u8; 2],
    pub daux: [u8; 2],
}

impl Dcb {
    pub const ADDR: u16 = DDEVIC;
    pub const SIZE: usize = size_of::<Dcb>();

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        bytemuck::cast(bytes)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        bytemuck::cast(*self)
    }

    /// The serial request this block describes. The bus ID is the base device plus the
    /// unit number, less one.
    pub fn to_request(&self) -> SioRequest {
        SioRequest {
            device: self.ddevic.wrapping_add(self.dunit).wrapping_sub(1),
            command: self.dcomnd,
            mode: self.dstats,
            timeout: self.dtimlo,
            address: u16::from_le_bytes(self.dbuf),
            length: u16::from_le_bytes(self.dbyt),
            sector: u16::from_le_bytes(self.daux),
            aux: self.daux,
        }
    }
}
