use std::fmt;

use tokio::sync::mpsc;

use crate::error::WireError;

/// Severity of a caller-visible job log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageLevel {
    Debug,
    Information,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn to_wire(self) -> u8 {
        match self {
            MessageLevel::Debug => 0,
            MessageLevel::Information => 10,
            MessageLevel::Warning => 20,
            MessageLevel::Error => 30,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageLevel::Debug),
            10 => Ok(MessageLevel::Information),
            20 => Ok(MessageLevel::Warning),
            30 => Ok(MessageLevel::Error),
            other => Err(WireError::InvalidLevel(other)),
        }
    }
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLevel::Debug => write!(f, "debug"),
            MessageLevel::Information => write!(f, "info"),
            MessageLevel::Warning => write!(f, "warn"),
            MessageLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: MessageLevel,
    pub message: String,
}

/// Side channel a job writes its log to while it executes.
///
/// Clones share the same channel; messages arrive in the order they were
/// logged from a single producer. A logger created with [`JobLogger::discard`]
/// drops everything.
#[derive(Debug, Clone)]
pub struct JobLogger {
    tx: Option<mpsc::UnboundedSender<LogMessage>>,
}

impl JobLogger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn log(&self, level: MessageLevel, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            // The receiver is gone once the caller stops listening; nothing to do.
            let _ = tx.send(LogMessage {
                level,
                message: message.into(),
            });
        }
    }

    pub fn log_debug(&self, message: impl Into<String>) {
        self.log(MessageLevel::Debug, message);
    }

    pub fn log_information(&self, message: impl Into<String>) {
        self.log(MessageLevel::Information, message);
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.log(MessageLevel::Warning, message);
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(MessageLevel::Error, message);
    }
}
