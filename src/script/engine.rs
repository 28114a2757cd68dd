//! Script execution engine.
//!
//! Owns one interpreter session, opened on the first [`ScriptEngine::run`]
//! and reused afterwards. Dropping the engine closes the session, so every
//! exit path (completion, error, cancellation) releases it exactly once.
//!
//! While a script runs, everything the interpreter produces is forwarded to
//! the registered observers in production order, before `run` returns:
//!
//! - result objects → [`ScriptEngine::on_output_received`]
//! - diagnostic records and the engine's own messages →
//!   [`ScriptEngine::on_message_logged`]
//!
//! An engine runs one script at a time (`run` takes `&mut self`); use one
//! engine per concurrent job.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::output::OutputVariables;
use crate::error::HostError;
use crate::host::{HostEvent, Invocation, ScriptHost, Session};
use crate::job::MessageLevel;

pub const DEBUG_PREFERENCE: &str = "DebugPreference";
pub const VERBOSE_PREFERENCE: &str = "VerbosePreference";
/// Preference value that makes the interpreter emit a stream instead of
/// suppressing it.
pub const PREFERENCE_CONTINUE: &str = "Continue";

type MessageHandler = Box<dyn Fn(MessageLevel, &str) + Send + Sync>;
type OutputHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Lifecycle of the engine's interpreter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Ready,
    Disposed,
}

enum SessionState {
    Uninitialized,
    Ready(Box<dyn Session>),
    Disposed,
}

#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub script: &'a str,
    pub variables: &'a HashMap<String, String>,
    pub parameters: &'a HashMap<String, String>,
    pub output_variables: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        /// `None` unless the script explicitly asked to exit with a code.
        exit_code: Option<i32>,
        output_variables: OutputVariables,
    },
    Cancelled,
}

#[derive(Default)]
struct Observers {
    message: Vec<MessageHandler>,
    output: Vec<OutputHandler>,
}

impl Observers {
    fn log(&self, level: MessageLevel, message: &str) {
        for handler in &self.message {
            handler(level, message);
        }
    }

    fn dispatch(&self, event: HostEvent, exit_code: &mut Option<i32>) {
        match event {
            HostEvent::Output(value) => {
                for handler in &self.output {
                    handler(&value);
                }
            }
            HostEvent::Log(level, message) => self.log(level, &message),
            HostEvent::ShouldExit(code) => *exit_code = Some(code),
        }
    }
}

pub struct ScriptEngine {
    host: Arc<dyn ScriptHost>,
    session: SessionState,
    debug_logging: bool,
    verbose_logging: bool,
    observers: Observers,
}

impl ScriptEngine {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self {
            host,
            session: SessionState::Uninitialized,
            debug_logging: false,
            verbose_logging: false,
            observers: Observers::default(),
        }
    }

    /// Capture the interpreter's debug stream.
    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// Capture the interpreter's verbose stream.
    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.verbose_logging = enabled;
        self
    }

    pub fn on_message_logged(
        &mut self,
        handler: impl Fn(MessageLevel, &str) + Send + Sync + 'static,
    ) {
        self.observers.message.push(Box::new(handler));
    }

    pub fn on_output_received(&mut self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.observers.output.push(Box::new(handler));
    }

    pub fn session_status(&self) -> SessionStatus {
        match self.session {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Ready(_) => SessionStatus::Ready,
            SessionState::Disposed => SessionStatus::Disposed,
        }
    }

    async fn ensure_session(&mut self) -> Result<(), HostError> {
        match self.session {
            SessionState::Ready(_) => Ok(()),
            SessionState::Disposed => Err(HostError::SessionDisposed),
            SessionState::Uninitialized => {
                let session = self.host.open_session().await?;
                self.session = SessionState::Ready(session);
                Ok(())
            }
        }
    }

    /// Run a script in the session.
    ///
    /// Firing `cancel` asks the interpreter to stop and returns
    /// [`RunOutcome::Cancelled`] right away, without waiting for the script to
    /// acknowledge. A script runtime error is returned as an error.
    pub async fn run(
        &mut self,
        request: RunRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, HostError> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        self.ensure_session().await?;
        let (debug_logging, verbose_logging) = (self.debug_logging, self.verbose_logging);
        let observers = &self.observers;
        let SessionState::Ready(session) = &mut self.session else {
            return Err(HostError::SessionDisposed);
        };

        // Ordinal order, so of two names differing only by case the later one wins.
        let mut variables: Vec<_> = request.variables.iter().collect();
        variables.sort();
        for (name, value) in variables {
            observers.log(MessageLevel::Debug, &format!("Importing {name}={value}"));
            session.set_variable(name, value);
        }
        if debug_logging {
            session.set_variable(DEBUG_PREFERENCE, PREFERENCE_CONTINUE);
        }
        if verbose_logging {
            session.set_variable(VERBOSE_PREFERENCE, PREFERENCE_CONTINUE);
        }
        let mut parameters: Vec<_> = request.parameters.iter().collect();
        parameters.sort();
        for (name, value) in parameters {
            observers.log(MessageLevel::Debug, &format!("Assigning parameter {name}={value}"));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let mut exit_code = None;

        let finished = {
            let invoke = session.invoke(
                Invocation {
                    script: request.script,
                    parameters: request.parameters,
                    exports: request.output_variables,
                },
                tx,
                stop.clone(),
            );
            tokio::pin!(invoke);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stop.cancel();
                        break None;
                    }
                    Some(event) = rx.recv() => observers.dispatch(event, &mut exit_code),
                    result = &mut invoke => break Some(result),
                }
            }
        };

        while let Ok(event) = rx.try_recv() {
            observers.dispatch(event, &mut exit_code);
        }

        match finished {
            None => {
                tracing::debug!("Script invocation cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Some(Err(e)) => Err(e),
            Some(Ok(())) => {
                let mut output_variables = OutputVariables::new();
                for name in request.output_variables {
                    output_variables.insert(name.as_str(), session.get_variable(name));
                }
                Ok(RunOutcome::Completed {
                    exit_code,
                    output_variables,
                })
            }
        }
    }

    /// Close the session if one was opened. Idempotent.
    pub fn dispose(&mut self) {
        let previous = std::mem::replace(&mut self.session, SessionState::Disposed);
        if let SessionState::Ready(mut session) = previous {
            session.close();
            tracing::debug!("Closed interpreter session");
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
