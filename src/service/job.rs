use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ServiceManager, ServiceStatus};
use crate::error::{JobError, WireError};
use crate::job::{JobContext, JobKind, JobLogger, JobOutcome, RemoteJob};
use crate::wire::{WireReader, WireWriter};

/// Status poll interval while waiting for a service to settle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlServiceJob {
    pub service_name: String,
    /// Only `Running` and `Stopped` can be requested.
    pub target_status: ServiceStatus,
    pub wait_for_target_status: bool,
}

impl ControlServiceJob {
    pub fn start(service_name: impl Into<String>, wait: bool) -> Self {
        Self {
            service_name: service_name.into(),
            target_status: ServiceStatus::Running,
            wait_for_target_status: wait,
        }
    }

    pub fn stop(service_name: impl Into<String>, wait: bool) -> Self {
        Self {
            service_name: service_name.into(),
            target_status: ServiceStatus::Stopped,
            wait_for_target_status: wait,
        }
    }

    async fn wait_for_start(
        &self,
        services: &dyn ServiceManager,
        log: &JobLogger,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome<()>, JobError> {
        let mut left_stopped = false;
        loop {
            let status = services.status(&self.service_name).await?;
            match status {
                ServiceStatus::Running => {
                    log.log_information("Service is running.");
                    return Ok(JobOutcome::Completed(()));
                }
                ServiceStatus::Stopped => {
                    if left_stopped || services.has_failed(&self.service_name).await? {
                        log.log_error("Service stopped immediately after starting.");
                        return Ok(JobOutcome::Completed(()));
                    }
                }
                other => {
                    if !left_stopped {
                        log.log_debug(format!("Service status is {other}"));
                        left_stopped = true;
                    }
                }
            }
            if pause(cancel).await {
                return Ok(JobOutcome::Cancelled);
            }
        }
    }

    async fn wait_for_stop(
        &self,
        services: &dyn ServiceManager,
        log: &JobLogger,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome<()>, JobError> {
        let mut last = None;
        loop {
            let status = services.status(&self.service_name).await?;
            if status == ServiceStatus::Stopped {
                log.log_information("Service is stopped.");
                return Ok(JobOutcome::Completed(()));
            }
            if last != Some(status) {
                log.log_debug(format!("Service status is {status}"));
                last = Some(status);
            }
            if pause(cancel).await {
                return Ok(JobOutcome::Cancelled);
            }
        }
    }
}

/// Sleep one poll interval; `true` if cancelled instead.
async fn pause(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(POLL_INTERVAL) => false,
    }
}

#[async_trait]
impl RemoteJob for ControlServiceJob {
    type Response = ();

    const KIND: JobKind = JobKind::ControlService;

    fn serialize_request(&self, writer: &mut WireWriter) {
        writer.write_string(&self.service_name);
        writer.write_i32(self.target_status.code());
        writer.write_bool(self.wait_for_target_status);
    }

    fn deserialize_request(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_name: reader.read_string()?,
            target_status: ServiceStatus::from_code(reader.read_i32()?)?,
            wait_for_target_status: reader.read_bool()?,
        })
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        cancel: CancellationToken,
    ) -> Result<JobOutcome<()>, JobError> {
        let services = ctx.service_manager();
        let log = ctx.log();
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        match self.target_status {
            ServiceStatus::Running => {
                if services.status(&self.service_name).await? == ServiceStatus::Running {
                    log.log_information("Service is already running.");
                    return Ok(JobOutcome::Completed(()));
                }
                services.start(&self.service_name).await?;
                if self.wait_for_target_status {
                    return self.wait_for_start(services, log, &cancel).await;
                }
            }
            ServiceStatus::Stopped => {
                if services.status(&self.service_name).await? == ServiceStatus::Stopped {
                    log.log_information("Service is already stopped.");
                    return Ok(JobOutcome::Completed(()));
                }
                services.stop(&self.service_name).await?;
                if self.wait_for_target_status {
                    return self.wait_for_stop(services, log, &cancel).await;
                }
            }
            other => {
                return Err(JobError::Execution(format!(
                    "Cannot change service status to {other}"
                )));
            }
        }
        Ok(JobOutcome::Completed(()))
    }

    fn serialize_response(_writer: &mut WireWriter, _response: &()) {}

    fn deserialize_response(_reader: &mut WireReader<'_>) -> Result<(), WireError> {
        Ok(())
    }
}
