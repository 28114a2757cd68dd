use thiserror::Error;

use crate::agent::RejectReason;

/// Malformed job payload: the bytes on the wire do not decode into what the
/// reader expects. Never retried; it means a protocol or version mismatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed job payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("malformed job payload: length {0} is out of range")]
    LengthOverflow(u64),

    #[error("malformed job payload: string is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed job payload: unknown job kind {0}")]
    UnknownJobKind(u8),

    #[error("malformed job payload: unknown frame tag {0:#04x}")]
    UnknownFrame(u8),

    #[error("malformed job payload: unexpected frame tag {0:#04x}")]
    UnexpectedFrame(u8),

    #[error("malformed job payload: unknown message level {0}")]
    InvalidLevel(u8),

    #[error("malformed job payload: unknown service status {0}")]
    UnknownServiceStatus(i32),

    #[error("malformed job payload: unknown rejection reason {0}")]
    UnknownRejectReason(u8),
}

/// Failures of the interpreter capability driven by the script engine.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to start interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("interpreter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("script failed: {0}")]
    ScriptFailed(String),

    #[error("interpreter protocol error: {0}")]
    Protocol(String),

    #[error("session has already been disposed")]
    SessionDisposed,
}

/// A job ran (or tried to) and failed. Cancellation is never reported here.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Errors seen by the caller when dispatching a job to an agent.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    MalformedPayload(#[from] WireError),

    /// The agent refused the job before running it.
    #[error("agent rejected job: {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("job failed: {0}")]
    Execution(String),

    #[error("agent closed the connection before the job completed")]
    ConnectionClosed,

    #[error("timed out connecting to agent")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, DispatchError>;
