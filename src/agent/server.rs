use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::{Frame, RejectReason};
use crate::config::AgentConfig;
use crate::error::{DispatchError, WireError};
use crate::host::{PwshHost, ScriptHost};
use crate::job::{AnyJob, JobContext, JobLogger, JobOutcome};
use crate::service::{ServiceManager, SystemdServiceManager};

/// Accepts connections and executes one dispatched job per connection.
pub struct AgentServer {
    config: AgentConfig,
    script_host: Arc<dyn ScriptHost>,
    service_manager: Arc<dyn ServiceManager>,
    slots: Arc<Semaphore>,
}

impl AgentServer {
    pub fn new(
        config: AgentConfig,
        script_host: Arc<dyn ScriptHost>,
        service_manager: Arc<dyn ServiceManager>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config,
            script_host,
            service_manager,
            slots,
        }
    }

    /// Server backed by `pwsh` and `systemctl`.
    pub fn with_system_backends(config: AgentConfig) -> Self {
        let script_host = Arc::new(PwshHost::new(config.host.clone()));
        Self::new(config, script_host, Arc::new(SystemdServiceManager::new()))
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// On shutdown the listener stops accepting, running jobs are cancelled
    /// and this returns once every connection has finished.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Agent listening"
        );

        let server = Arc::new(self);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                                tracing::warn!(
                                    peer = %peer,
                                    error = %e,
                                    "Connection ended with error"
                                );
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        tracing::info!(active = connections.len(), "Draining connections");
        while connections.join_next().await.is_some() {}
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), DispatchError> {
        stream.set_nodelay(true)?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_bytes)
            .new_codec();
        let (mut sink, mut incoming) = Framed::new(stream, codec).split();

        let first = match incoming.next().await {
            Some(Ok(bytes)) => bytes,
            // The codec reports an over-limit length prefix as invalid data.
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(peer = %peer, error = %e, "Rejecting oversized frame");
                let rejected = Frame::Rejected(RejectReason::FrameTooLarge, e.to_string());
                sink.send(rejected.encode()).await?;
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                tracing::debug!(peer = %peer, "Connection closed before dispatch");
                return Ok(());
            }
        };
        let job = match decode_dispatch(&first) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Rejecting job");
                let rejected = Frame::Rejected(RejectReason::MalformedPayload, e.to_string());
                sink.send(rejected.encode()).await?;
                return Ok(());
            }
        };

        let job_id = Uuid::new_v4();
        let kind = job.kind();
        let cancel = shutdown.child_token();

        let Ok(_permit) = self.slots.acquire().await else {
            return Ok(());
        };
        tracing::info!(job_id = %job_id, kind = %kind, peer = %peer, "Executing job");

        let (log, mut log_rx) = JobLogger::channel();
        let ctx = JobContext::new(log, self.script_host.clone(), self.service_manager.clone());
        let execution = job.execute(&ctx, cancel.clone());
        tokio::pin!(execution);

        // Cleared once the caller hangs up; the job is cancelled at that point.
        let mut connected = true;
        let result = loop {
            tokio::select! {
                biased;
                Some(message) = log_rx.recv() => {
                    if connected && sink.send(Frame::Log(message).encode()).await.is_err() {
                        connected = false;
                        cancel.cancel();
                    }
                }
                frame = incoming.next(), if connected => match frame {
                    Some(Ok(bytes)) => match Frame::decode(&bytes) {
                        Ok(Frame::Cancel) => {
                            tracing::info!(job_id = %job_id, "Cancellation requested");
                            cancel.cancel();
                        }
                        Ok(other) => {
                            tracing::warn!(
                                job_id = %job_id,
                                tag = other.tag(),
                                "Ignoring unexpected frame"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                job_id = %job_id,
                                error = %e,
                                "Ignoring malformed frame"
                            );
                        }
                    },
                    Some(Err(_)) | None => {
                        tracing::info!(job_id = %job_id, "Caller disconnected, cancelling job");
                        connected = false;
                        cancel.cancel();
                    }
                },
                result = &mut execution => break result,
            }
        };

        if !connected {
            return Ok(());
        }
        while let Ok(message) = log_rx.try_recv() {
            sink.send(Frame::Log(message).encode()).await?;
        }

        let terminal = match result {
            Ok(JobOutcome::Completed(payload)) => {
                tracing::info!(job_id = %job_id, kind = %kind, "Job completed");
                Frame::Completed(payload)
            }
            Ok(JobOutcome::Cancelled) => {
                tracing::info!(job_id = %job_id, kind = %kind, "Job cancelled");
                Frame::Cancelled
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, kind = %kind, error = %e, "Job failed");
                Frame::Failed(e.to_string())
            }
        };
        sink.send(terminal.encode()).await?;
        Ok(())
    }
}

fn decode_dispatch(bytes: &[u8]) -> Result<AnyJob, WireError> {
    match Frame::decode(bytes)? {
        Frame::Dispatch { kind, payload } => AnyJob::decode(kind, &payload),
        other => Err(WireError::UnexpectedFrame(other.tag())),
    }
}
