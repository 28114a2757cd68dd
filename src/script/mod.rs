//! Script execution: variable discovery, the execution engine and the job
//! that ties them to the wire.

pub mod discovery;
pub mod engine;
mod job;
mod output;

pub use discovery::{discover_variables, extract_variables, VariableContext};
pub use engine::{RunOutcome, RunRequest, ScriptEngine, SessionStatus};
pub use job::{ExecuteScriptJob, ScriptResult};
pub use output::OutputVariables;
