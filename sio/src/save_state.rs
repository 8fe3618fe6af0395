use crate::error::SaveStateError;
use crate::step::{Step, StepKind};

use common::constants::COMMAND_FRAME_LEN;

/// A command frame caught half way. Only present while the bus is mid frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedBusState {
    pub command_cycles_per_bit: u32,
    pub command_buffer_index: u8,
    pub command_buffer: [u8; COMMAND_FRAME_LEN],
}

impl SavedBusState {
    pub fn validate(&self) -> Result<(), SaveStateError> {
        if self.command_buffer_index as usize > COMMAND_FRAME_LEN {
            return Err(SaveStateError::CommandBufferIndex(self.command_buffer_index));
        }
        Ok(())
    }
}

/// A step plus the bytes it sends, or for an in progress receive, the bytes it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedStep {
    pub kind: StepKind,
    pub arg1: u32,
    pub arg2: u32,
    pub transfer_data: Vec<u8>,
}

impl SavedStep {
    pub fn from_step(step: &Step, transfer_data: Vec<u8>) -> Self {
        let (kind, arg1, arg2) = step.to_parts();
        SavedStep { kind, arg1, arg2, transfer_data }
    }

    pub fn from_code(
        code: u8,
        arg1: u32,
        arg2: u32,
        transfer_data: Vec<u8>,
    ) -> Result<Self, SaveStateError> {
        Ok(SavedStep { kind: StepKind::from_code(code)?, arg1, arg2, transfer_data })
    }

    pub fn code(&self) -> u8 {
        self.kind.code()
    }

    /// The step this describes, if it's one that can be resumed.
    pub fn to_step(&self) -> Result<Step, SaveStateError> {
        let step = Step::from_parts(self.kind, self.arg1, self.arg2)?;
        let expected = step.transfer_len();
        let actual = self.transfer_data.len();

        let length_ok = if step.is_send_step() {
            actual == expected
        } else if step.is_receive_step() {
            actual <= expected
        } else {
            actual == 0
        };

        if !length_ok {
            return Err(SaveStateError::StepDataLength { kind: self.kind, expected, actual });
        }

        if let Step::SetTransferRate { cycles_per_bit, cycles_per_byte } = step {
            if cycles_per_bit == 0 || cycles_per_byte == 0 {
                return Err(SaveStateError::TransferRate { cycles_per_bit, cycles_per_byte });
            }
        }

        Ok(step)
    }
}

/// Everything needed to pick a command back up where it left off. Times are relative
/// to the bus clock when saved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavedActiveCommand {
    pub device_id: u8,
    pub transfer_index: u32,
    pub transfer_error: bool,
    pub transfer_cycles_per_bit: u32,
    pub transfer_cycles_per_byte: u32,
    pub transmit_synchronous: bool,
    pub transfer_start_time: i32,
    pub step_delay: u32,
    pub queue_time: i64,
    pub queue_cycles_per_byte: u32,
    pub command_frame_end_time: i64,
    pub command_deassert_time: i64,
    pub current_step: Option<SavedStep>,
    pub steps: Vec<SavedStep>,
}
