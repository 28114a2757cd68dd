//! Job contract: a unit of work that serializes its own request, is rebuilt
//! on the agent, executes there and serializes a typed response.
//!
//! # Lifecycle
//!
//! 1. The caller builds a job and encodes it with [`encode_request`]
//! 2. The dispatch layer sends [`JobKind`] alongside the bytes
//! 3. The agent rebuilds it with [`AnyJob::decode`], which picks the
//!    deserializer for the kind
//! 4. [`RemoteJob::execute`] runs with a [`JobContext`] and a cancellation
//!    token, writing log messages to the context's [`JobLogger`]
//! 5. The response travels back and is decoded with [`decode_response`]
//!
//! Cancellation is a terminal [`JobOutcome`], never a [`JobError`], so a
//! caller can always tell "the job failed" from "the job was cancelled".

mod log;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, WireError};
use crate::host::ScriptHost;
use crate::script::ExecuteScriptJob;
use crate::service::{ControlServiceJob, ServiceManager};
use crate::wire::{WireReader, WireWriter};

pub use log::{JobLogger, LogMessage, MessageLevel};

/// How a job execution ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> JobOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> JobOutcome<U> {
        match self {
            JobOutcome::Completed(value) => JobOutcome::Completed(f(value)),
            JobOutcome::Cancelled => JobOutcome::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            JobOutcome::Completed(value) => Some(value),
            JobOutcome::Cancelled => None,
        }
    }
}

/// Type discriminator carried next to every serialized request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ExecuteScript,
    ControlService,
}

impl JobKind {
    pub fn to_wire(self) -> u8 {
        match self {
            JobKind::ExecuteScript => 1,
            JobKind::ControlService => 2,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(JobKind::ExecuteScript),
            2 => Ok(JobKind::ControlService),
            other => Err(WireError::UnknownJobKind(other)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::ExecuteScript => write!(f, "execute-script"),
            JobKind::ControlService => write!(f, "control-service"),
        }
    }
}

/// Everything a job may use on the agent while it executes.
#[derive(Clone)]
pub struct JobContext {
    log: JobLogger,
    script_host: Arc<dyn ScriptHost>,
    service_manager: Arc<dyn ServiceManager>,
}

impl JobContext {
    pub fn new(
        log: JobLogger,
        script_host: Arc<dyn ScriptHost>,
        service_manager: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            log,
            script_host,
            service_manager,
        }
    }

    pub fn log(&self) -> &JobLogger {
        &self.log
    }

    pub fn script_host(&self) -> Arc<dyn ScriptHost> {
        self.script_host.clone()
    }

    pub fn service_manager(&self) -> &dyn ServiceManager {
        self.service_manager.as_ref()
    }

    /// Same resources, different log sink.
    pub fn with_log(&self, log: JobLogger) -> Self {
        Self {
            log,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait RemoteJob: Sized + Send + Sync {
    type Response: Send;

    const KIND: JobKind;

    /// Must be the exact inverse of [`RemoteJob::deserialize_request`].
    fn serialize_request(&self, writer: &mut WireWriter);

    fn deserialize_request(reader: &mut WireReader<'_>) -> Result<Self, WireError>;

    /// Run the job. Implementations observe `cancel` at safe points and
    /// return [`JobOutcome::Cancelled`] promptly once it fires.
    async fn execute(
        &self,
        ctx: &JobContext,
        cancel: CancellationToken,
    ) -> Result<JobOutcome<Self::Response>, JobError>;

    fn serialize_response(writer: &mut WireWriter, response: &Self::Response);

    fn deserialize_response(reader: &mut WireReader<'_>) -> Result<Self::Response, WireError>;
}

pub fn encode_request<J: RemoteJob>(job: &J) -> Bytes {
    let mut writer = WireWriter::new();
    job.serialize_request(&mut writer);
    writer.into_bytes()
}

pub fn decode_request<J: RemoteJob>(payload: &[u8]) -> Result<J, WireError> {
    J::deserialize_request(&mut WireReader::new(payload))
}

pub fn encode_response<J: RemoteJob>(response: &J::Response) -> Bytes {
    let mut writer = WireWriter::new();
    J::serialize_response(&mut writer, response);
    writer.into_bytes()
}

pub fn decode_response<J: RemoteJob>(payload: &[u8]) -> Result<J::Response, WireError> {
    J::deserialize_response(&mut WireReader::new(payload))
}

/// A job rebuilt on the agent from its discriminator and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyJob {
    ExecuteScript(ExecuteScriptJob),
    ControlService(ControlServiceJob),
}

impl AnyJob {
    pub fn kind(&self) -> JobKind {
        match self {
            AnyJob::ExecuteScript(_) => JobKind::ExecuteScript,
            AnyJob::ControlService(_) => JobKind::ControlService,
        }
    }

    pub fn decode(kind: JobKind, payload: &[u8]) -> Result<Self, WireError> {
        match kind {
            JobKind::ExecuteScript => decode_request(payload).map(AnyJob::ExecuteScript),
            JobKind::ControlService => decode_request(payload).map(AnyJob::ControlService),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            AnyJob::ExecuteScript(job) => encode_request(job),
            AnyJob::ControlService(job) => encode_request(job),
        }
    }

    /// Execute and serialize the response for the return trip.
    pub async fn execute(
        &self,
        ctx: &JobContext,
        cancel: CancellationToken,
    ) -> Result<JobOutcome<Bytes>, JobError> {
        match self {
            AnyJob::ExecuteScript(job) => execute_encoded(job, ctx, cancel).await,
            AnyJob::ControlService(job) => execute_encoded(job, ctx, cancel).await,
        }
    }
}

async fn execute_encoded<J: RemoteJob>(
    job: &J,
    ctx: &JobContext,
    cancel: CancellationToken,
) -> Result<JobOutcome<Bytes>, JobError> {
    let outcome = job.execute(ctx, cancel).await?;
    Ok(outcome.map(|response| encode_response::<J>(&response)))
}

impl From<ExecuteScriptJob> for AnyJob {
    fn from(job: ExecuteScriptJob) -> Self {
        AnyJob::ExecuteScript(job)
    }
}

impl From<ControlServiceJob> for AnyJob {
    fn from(job: ControlServiceJob) -> Self {
        AnyJob::ControlService(job)
    }
}
