use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::frame::Frame;
use crate::config::ClientConfig;
use crate::error::{DispatchError, Result, WireError};
use crate::job::{decode_response, encode_request, JobOutcome, LogMessage, RemoteJob};

/// Caller side of the dispatch protocol.
#[derive(Debug, Clone)]
pub struct AgentClient {
    config: ClientConfig,
}

impl AgentClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    async fn connect(&self) -> Result<Framed<TcpStream, LengthDelimitedCodec>> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| DispatchError::Timeout)??;
        stream.set_nodelay(true)?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_bytes)
            .new_codec();
        Ok(Framed::new(stream, codec))
    }

    /// Dispatch `job` and wait for its outcome, passing each log message the
    /// job emits to `on_log` as it arrives.
    ///
    /// When `cancel` fires a cancel frame is sent and `Cancelled` is returned
    /// without waiting for the agent to wind the job down.
    pub async fn execute<J, F>(
        &self,
        job: &J,
        cancel: &CancellationToken,
        mut on_log: F,
    ) -> Result<JobOutcome<J::Response>>
    where
        J: RemoteJob,
        F: FnMut(LogMessage),
    {
        let mut framed = self.connect().await?;
        let dispatch = Frame::Dispatch {
            kind: J::KIND,
            payload: encode_request(job),
        };
        framed.send(dispatch.encode()).await?;
        tracing::debug!(addr = %self.config.addr, kind = %J::KIND, "Job dispatched");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // The agent may already be gone; closing the socket cancels too.
                    let _ = framed.send(Frame::Cancel.encode()).await;
                    tracing::debug!(kind = %J::KIND, "Job cancelled by caller");
                    return Ok(JobOutcome::Cancelled);
                }
                incoming = framed.next() => {
                    let bytes = match incoming {
                        Some(bytes) => bytes?,
                        None => return Err(DispatchError::ConnectionClosed),
                    };
                    match Frame::decode(&bytes)? {
                        Frame::Log(message) => on_log(message),
                        Frame::Completed(payload) => {
                            return Ok(JobOutcome::Completed(decode_response::<J>(&payload)?));
                        }
                        Frame::Cancelled => return Ok(JobOutcome::Cancelled),
                        Frame::Failed(message) => return Err(DispatchError::Execution(message)),
                        Frame::Rejected(reason, message) => {
                            return Err(DispatchError::Rejected { reason, message });
                        }
                        other => return Err(WireError::UnexpectedFrame(other.tag()).into()),
                    }
                }
            }
        }
    }
}
