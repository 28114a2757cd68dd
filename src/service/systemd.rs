use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ServiceManager, ServiceStatus};
use crate::error::JobError;

/// [`ServiceManager`] backed by `systemctl`.
///
/// Start and stop requests use `--no-block`, so waiting for the target state
/// is left to the job's own polling.
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    program: PathBuf,
}

impl Default for SystemdServiceManager {
    fn default() -> Self {
        Self {
            program: PathBuf::from("systemctl"),
        }
    }
}

impl SystemdServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<std::process::Output, JobError> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                JobError::Execution(format!("failed to run {}: {e}", self.program.display()))
            })
    }

    async fn request(&self, verb: &str, name: &str) -> Result<(), JobError> {
        let output = self.systemctl(&[verb, "--no-block", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(JobError::Execution(if stderr.trim().is_empty() {
            format!("systemctl {verb} {name} failed ({})", output.status)
        } else {
            stderr.trim().to_string()
        }))
    }
}

/// Map `systemctl is-active` output to a service status.
///
/// `failed` reads as stopped; [`ServiceManager::has_failed`] tells the two apart.
fn parse_active_state(state: &str) -> ServiceStatus {
    match state.trim() {
        "active" | "reloading" => ServiceStatus::Running,
        "activating" => ServiceStatus::StartPending,
        "deactivating" => ServiceStatus::StopPending,
        _ => ServiceStatus::Stopped,
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn status(&self, name: &str) -> Result<ServiceStatus, JobError> {
        // `is-active` exits non-zero for anything but active; only stdout matters.
        let output = self.systemctl(&["is-active", name]).await?;
        Ok(parse_active_state(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn start(&self, name: &str) -> Result<(), JobError> {
        tracing::debug!(service = name, "Requesting service start");
        // Clear a stale failed state so `has_failed` only reports this attempt.
        let reset = self.systemctl(&["reset-failed", name]).await?;
        if !reset.status.success() {
            tracing::debug!(service = name, status = %reset.status, "reset-failed was refused");
        }
        self.request("start", name).await
    }

    async fn stop(&self, name: &str) -> Result<(), JobError> {
        tracing::debug!(service = name, "Requesting service stop");
        self.request("stop", name).await
    }

    async fn has_failed(&self, name: &str) -> Result<bool, JobError> {
        let output = self.systemctl(&["is-failed", name]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "failed")
    }
}
