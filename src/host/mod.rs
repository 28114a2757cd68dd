//! The interpreter capability the script engine drives.
//!
//! A [`ScriptHost`] opens [`Session`]s. A session holds a variable namespace
//! and runs scripts against it; while a script runs the session reports what
//! it produces as [`HostEvent`]s, in the order the interpreter produced them.

pub mod pwsh;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::HostError;
use crate::job::MessageLevel;

pub use pwsh::PwshHost;

/// Something the interpreter produced during an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// An object written to the result stream, in its textual form.
    Output(String),
    /// A record from one of the interpreter's diagnostic streams.
    Log(MessageLevel, String),
    /// The script asked to exit with this code.
    ShouldExit(i32),
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;

/// A single script invocation against a session.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub script: &'a str,
    /// Bound by name to the script's parameters.
    pub parameters: &'a HashMap<String, String>,
    /// Variables the caller will read back with [`Session::get_variable`].
    pub exports: &'a [String],
}

#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn Session>, HostError>;
}

#[async_trait]
pub trait Session: Send {
    fn set_variable(&mut self, name: &str, value: &str);

    /// Textual value of a variable, or `None` if it is not set.
    fn get_variable(&self, name: &str) -> Option<String>;

    /// Run a script to completion, sending events as they are produced.
    ///
    /// When `stop` fires the session must abort the script without relying
    /// on the script's cooperation. A script runtime error is returned as
    /// [`HostError::ScriptFailed`].
    async fn invoke(
        &mut self,
        invocation: Invocation<'_>,
        events: HostEventSender,
        stop: CancellationToken,
    ) -> Result<(), HostError>;

    /// Release interpreter resources. Called exactly once.
    fn close(&mut self);
}
