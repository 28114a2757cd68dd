//! Dispatch transport between a caller and the agent that runs its jobs.
//!
//! Each job gets its own TCP connection carrying length-delimited frames
//! (see [`Frame`]). The caller sends a dispatch frame holding the job's
//! discriminator and serialized request; the agent streams the job's log
//! messages back and finishes with one terminal frame. A cancel frame from
//! the caller, or the caller closing the connection, cancels the job.

mod client;
mod frame;
mod server;

pub use client::AgentClient;
pub use frame::{Frame, RejectReason};
pub use server::AgentServer;
