use crate::error::SaveStateError;

use std::fmt;

use derive_more::IsVariant;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// One unit of work in a device's command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum Step {
    Delay { ticks: u32 },
    Send { len: u32 },
    /// Send whose last byte is a checksum.
    SendAutoProtocol { len: u32 },
    Receive { len: u32, id: u32 },
    /// Receive a data frame plus checksum, answering ACK or NAK on our own.
    ReceiveAutoProtocol { len: u32, id: u32 },
    SetTransferRate { cycles_per_bit: u32, cycles_per_byte: u32 },
    SetSynchronousTransmit { enable: bool },
    Fence { id: u32 },
    EndCommand,

    // Replies collapsed to bookkeeping on the accelerated path.
    AccelSendAck,
    AccelSendNak,
    AccelSendComplete,
    AccelSendError,
}

/// Stable codes for [`Step`] variants, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum StepKind {
    None = 0,
    Delay,
    Send,
    SendAutoProtocol,
    Receive,
    ReceiveAutoProtocol,
    SetTransferRate,
    SetSynchronousTransmit,
    Fence,
    EndCommand,
    AccelSendAck,
    AccelSendNak,
    AccelSendComplete,
    AccelSendError,
}

impl StepKind {
    pub fn from_code(code: u8) -> Result<StepKind, SaveStateError> {
        StepKind::from_u8(code).ok_or(SaveStateError::UnknownStep(code))
    }

    pub fn code(self) -> u8 {
        // Every variant fits.
        self.to_u8().unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        match self {
            StepKind::None => "none",
            StepKind::Delay => "delay",
            StepKind::Send => "send",
            StepKind::SendAutoProtocol => "sendauto",
            StepKind::Receive => "receive",
            StepKind::ReceiveAutoProtocol => "receiveauto",
            StepKind::SetTransferRate => "setrate",
            StepKind::SetSynchronousTransmit => "setsync",
            StepKind::Fence => "fence",
            StepKind::EndCommand => "end",
            StepKind::AccelSendAck => "accelack",
            StepKind::AccelSendNak => "accelnak",
            StepKind::AccelSendComplete => "accelcomplete",
            StepKind::AccelSendError => "accelerror",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Delay { .. } => StepKind::Delay,
            Step::Send { .. } => StepKind::Send,
            Step::SendAutoProtocol { .. } => StepKind::SendAutoProtocol,
            Step::Receive { .. } => StepKind::Receive,
            Step::ReceiveAutoProtocol { .. } => StepKind::ReceiveAutoProtocol,
            Step::SetTransferRate { .. } => StepKind::SetTransferRate,
            Step::SetSynchronousTransmit { .. } => StepKind::SetSynchronousTransmit,
            Step::Fence { .. } => StepKind::Fence,
            Step::EndCommand => StepKind::EndCommand,
            Step::AccelSendAck => StepKind::AccelSendAck,
            Step::AccelSendNak => StepKind::AccelSendNak,
            Step::AccelSendComplete => StepKind::AccelSendComplete,
            Step::AccelSendError => StepKind::AccelSendError,
        }
    }

    /// Bytes of the transfer buffer the step owns.
    pub fn transfer_len(&self) -> usize {
        match *self {
            Step::Send { len }
            | Step::SendAutoProtocol { len }
            | Step::Receive { len, .. }
            | Step::ReceiveAutoProtocol { len, .. } => len as usize,
            _ => 0,
        }
    }

    pub fn is_send_step(&self) -> bool {
        self.is_send() || self.is_send_auto_protocol()
    }

    pub fn is_receive_step(&self) -> bool {
        self.is_receive() || self.is_receive_auto_protocol()
    }

    pub fn is_auto_protocol(&self) -> bool {
        self.is_send_auto_protocol() || self.is_receive_auto_protocol()
    }

    /// Flattens to `(kind, arg1, arg2)`. Transfers keep their length in `arg1`; the
    /// rate change keeps cycles per byte in `arg1` and per bit in `arg2`.
    pub fn to_parts(&self) -> (StepKind, u32, u32) {
        let (arg1, arg2) = match *self {
            Step::Delay { ticks } => (ticks, 0),
            Step::Send { len } | Step::SendAutoProtocol { len } => (len, 0),
            Step::Receive { len, id } | Step::ReceiveAutoProtocol { len, id } => (len, id),
            Step::SetTransferRate { cycles_per_bit, cycles_per_byte } => {
                (cycles_per_byte, cycles_per_bit)
            }
            Step::SetSynchronousTransmit { enable } => (enable as u32, 0),
            Step::Fence { id } => (id, 0),
            _ => (0, 0),
        };
        (self.kind(), arg1, arg2)
    }

    /// Inverse of [`Step::to_parts`]. Accelerated replies never outlive a call into
    /// the bus, so they aren't accepted.
    pub fn from_parts(kind: StepKind, arg1: u32, arg2: u32) -> Result<Step, SaveStateError> {
        Ok(match kind {
            StepKind::Delay => Step::Delay { ticks: arg1 },
            StepKind::Send => Step::Send { len: arg1 },
            StepKind::SendAutoProtocol => Step::SendAutoProtocol { len: arg1 },
            StepKind::Receive => Step::Receive { len: arg1, id: arg2 },
            StepKind::ReceiveAutoProtocol => Step::ReceiveAutoProtocol { len: arg1, id: arg2 },
            StepKind::SetTransferRate => {
                Step::SetTransferRate { cycles_per_bit: arg2, cycles_per_byte: arg1 }
            }
            StepKind::SetSynchronousTransmit => Step::SetSynchronousTransmit { enable: arg1 != 0 },
            StepKind::Fence => Step::Fence { id: arg1 },
            StepKind::EndCommand => Step::EndCommand,
            StepKind::None
            | StepKind::AccelSendAck
            | StepKind::AccelSendNak
            | StepKind::AccelSendComplete
            | StepKind::AccelSendError => return Err(SaveStateError::UnrestorableStep(kind)),
        })
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (kind, arg1, arg2) = self.to_parts();
        write!(f, "{kind}({arg1}, {arg2})")
    }
}
