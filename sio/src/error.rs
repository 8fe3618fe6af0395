use crate::step::StepKind;

use thiserror::Error;

/// Protocol misuse by a device, or a transfer the bus can't carry. These abort the
/// offending command rather than the whole bus, and are queued for
/// [`SioManager::take_faults`](crate::SioManager::take_faults).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SioError {
    #[error("{operation} queued with no active command")]
    NoActiveCommand { operation: &'static str },

    #[error("transfer of {requested} bytes doesn't fit in the {available} bytes left")]
    TransferBufferFull { requested: usize, available: usize },

    #[error("device {device:#04x} asked to bypass acceleration from a bus command")]
    BypassFromNormalCallback { device: u8 },

    #[error("device {device:#04x} queued steps and then declined the command")]
    NotHandledAfterQueue { device: u8 },

    #[error("device {device:#04x} queued steps and then bypassed acceleration")]
    BypassAfterQueue { device: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveStateError {
    #[error("unknown step code {0}")]
    UnknownStep(u8),

    #[error("{0:?} can't be restored")]
    UnrestorableStep(StepKind),

    #[error("step {kind:?} carries {actual} bytes of data, expected {expected}")]
    StepDataLength { kind: StepKind, expected: usize, actual: usize },

    #[error("transfer rate {cycles_per_bit}/{cycles_per_byte} out of range")]
    TransferRate { cycles_per_bit: u32, cycles_per_byte: u32 },

    #[error("transfer index {index} past the end of the transfer ({end})")]
    TransferIndex { index: u32, end: u32 },

    #[error("command buffer index {0} out of range")]
    CommandBufferIndex(u8),

    #[error("{0}")]
    Transfer(#[from] SioError),

    #[error("no such device interface")]
    UnknownInterface,
}
