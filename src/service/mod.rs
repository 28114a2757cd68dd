//! Service control: start or stop an operating-system service on the agent
//! and optionally wait for it to reach the requested state.

mod job;
pub mod systemd;

use std::fmt;

use async_trait::async_trait;

use crate::error::{JobError, WireError};

pub use job::ControlServiceJob;
pub use systemd::SystemdServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceStatus {
    pub fn code(self) -> i32 {
        match self {
            ServiceStatus::Stopped => 1,
            ServiceStatus::StartPending => 2,
            ServiceStatus::StopPending => 3,
            ServiceStatus::Running => 4,
            ServiceStatus::ContinuePending => 5,
            ServiceStatus::PausePending => 6,
            ServiceStatus::Paused => 7,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(ServiceStatus::Stopped),
            2 => Ok(ServiceStatus::StartPending),
            3 => Ok(ServiceStatus::StopPending),
            4 => Ok(ServiceStatus::Running),
            5 => Ok(ServiceStatus::ContinuePending),
            6 => Ok(ServiceStatus::PausePending),
            7 => Ok(ServiceStatus::Paused),
            other => Err(WireError::UnknownServiceStatus(other)),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "Stopped"),
            ServiceStatus::StartPending => write!(f, "StartPending"),
            ServiceStatus::StopPending => write!(f, "StopPending"),
            ServiceStatus::Running => write!(f, "Running"),
            ServiceStatus::ContinuePending => write!(f, "ContinuePending"),
            ServiceStatus::PausePending => write!(f, "PausePending"),
            ServiceStatus::Paused => write!(f, "Paused"),
        }
    }
}

/// The agent's view of the operating system's service manager.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn status(&self, name: &str) -> Result<ServiceStatus, JobError>;

    /// Request a start; returns once the request is accepted.
    async fn start(&self, name: &str) -> Result<(), JobError>;

    /// Request a stop; returns once the request is accepted.
    async fn stop(&self, name: &str) -> Result<(), JobError>;

    /// Whether the service failed since the last start request.
    ///
    /// Lets a waiting start notice a failure that happened between polls.
    async fn has_failed(&self, _name: &str) -> Result<bool, JobError> {
        Ok(false)
    }
}
