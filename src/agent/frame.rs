use bytes::Bytes;

use crate::error::WireError;
use crate::job::{JobKind, LogMessage, MessageLevel};
use crate::wire::{WireReader, WireWriter};

const TAG_DISPATCH: u8 = 0x01;
const TAG_CANCEL: u8 = 0x02;
const TAG_LOG: u8 = 0x10;
const TAG_COMPLETED: u8 = 0x11;
const TAG_FAILED: u8 = 0x12;
const TAG_CANCELLED: u8 = 0x13;
const TAG_REJECTED: u8 = 0x14;

/// Why an agent refused a connection's job before running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The dispatch frame or its job payload did not decode.
    MalformedPayload,
    /// The first frame exceeded the agent's frame size limit.
    FrameTooLarge,
}

impl RejectReason {
    pub fn to_wire(self) -> u8 {
        match self {
            RejectReason::MalformedPayload => 1,
            RejectReason::FrameTooLarge => 2,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(RejectReason::MalformedPayload),
            2 => Ok(RejectReason::FrameTooLarge),
            other => Err(WireError::UnknownRejectReason(other)),
        }
    }
}

/// One message on an agent connection.
///
/// Caller to agent: `Dispatch`, then optionally `Cancel`. Agent to caller:
/// any number of `Log` frames followed by exactly one terminal frame
/// (`Completed`, `Failed`, `Cancelled` or `Rejected`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Dispatch { kind: JobKind, payload: Bytes },
    Cancel,
    Log(LogMessage),
    Completed(Bytes),
    Failed(String),
    Cancelled,
    Rejected(RejectReason, String),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Dispatch { .. } => TAG_DISPATCH,
            Frame::Cancel => TAG_CANCEL,
            Frame::Log(_) => TAG_LOG,
            Frame::Completed(_) => TAG_COMPLETED,
            Frame::Failed(_) => TAG_FAILED,
            Frame::Cancelled => TAG_CANCELLED,
            Frame::Rejected(..) => TAG_REJECTED,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.write_u8(self.tag());
        match self {
            Frame::Dispatch { kind, payload } => {
                writer.write_u8(kind.to_wire());
                writer.write_raw(payload);
            }
            Frame::Log(message) => {
                writer.write_u8(message.level.to_wire());
                writer.write_string(&message.message);
            }
            Frame::Completed(payload) => writer.write_raw(payload),
            Frame::Failed(message) => writer.write_string(message),
            Frame::Rejected(reason, message) => {
                writer.write_u8(reason.to_wire());
                writer.write_string(message);
            }
            Frame::Cancel | Frame::Cancelled => {}
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let frame = match reader.read_u8()? {
            TAG_DISPATCH => Frame::Dispatch {
                kind: JobKind::from_wire(reader.read_u8()?)?,
                payload: Bytes::copy_from_slice(reader.read_remaining()),
            },
            TAG_CANCEL => Frame::Cancel,
            TAG_LOG => Frame::Log(LogMessage {
                level: MessageLevel::from_wire(reader.read_u8()?)?,
                message: reader.read_string()?,
            }),
            TAG_COMPLETED => Frame::Completed(Bytes::copy_from_slice(reader.read_remaining())),
            TAG_FAILED => Frame::Failed(reader.read_string()?),
            TAG_CANCELLED => Frame::Cancelled,
            TAG_REJECTED => Frame::Rejected(
                RejectReason::from_wire(reader.read_u8()?)?,
                reader.read_string()?,
            ),
            other => return Err(WireError::UnknownFrame(other)),
        };
        Ok(frame)
    }
}
