use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::engine::{RunOutcome, RunRequest, ScriptEngine};
use super::output::OutputVariables;
use crate::error::{JobError, WireError};
use crate::job::{JobContext, JobKind, JobOutcome, RemoteJob};
use crate::wire::{WireReader, WireWriter};

/// Run a script on the agent and bring back its exit code, output and
/// requested variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteScriptJob {
    pub script_text: String,
    pub debug_logging: bool,
    pub verbose_logging: bool,
    /// Accumulate non-blank output lines into [`ScriptResult::output`].
    pub collect_output: bool,
    /// Write each output object to the job log.
    pub log_output: bool,
    pub variables: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub output_variables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptResult {
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub output_variables: OutputVariables,
}

impl ExecuteScriptJob {
    pub fn new(script_text: impl Into<String>) -> Self {
        Self {
            script_text: script_text.into(),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variables.push(name.into());
        self
    }
}

#[async_trait]
impl RemoteJob for ExecuteScriptJob {
    type Response = ScriptResult;

    const KIND: JobKind = JobKind::ExecuteScript;

    fn serialize_request(&self, writer: &mut WireWriter) {
        writer.write_string(&self.script_text);
        writer.write_bool(self.debug_logging);
        writer.write_bool(self.verbose_logging);
        writer.write_bool(self.collect_output);
        writer.write_bool(self.log_output);
        writer.write_string_map(&self.variables);
        writer.write_string_map(&self.parameters);
        writer.write_string_list(&self.output_variables);
    }

    fn deserialize_request(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            script_text: reader.read_string()?,
            debug_logging: reader.read_bool()?,
            verbose_logging: reader.read_bool()?,
            collect_output: reader.read_bool()?,
            log_output: reader.read_bool()?,
            variables: reader.read_string_map()?,
            parameters: reader.read_string_map()?,
            output_variables: reader.read_string_list()?,
        })
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        cancel: CancellationToken,
    ) -> Result<JobOutcome<ScriptResult>, JobError> {
        let mut engine = ScriptEngine::new(ctx.script_host())
            .with_debug_logging(self.debug_logging)
            .with_verbose_logging(self.verbose_logging);

        let log = ctx.log().clone();
        engine.on_message_logged(move |level, message| log.log(level, message));

        if self.log_output {
            let log = ctx.log().clone();
            engine.on_output_received(move |value| log.log_information(value));
        }

        let collected = Arc::new(Mutex::new(Vec::new()));
        if self.collect_output {
            let collected = collected.clone();
            engine.on_output_received(move |value| {
                if !value.trim().is_empty() {
                    collected.lock().push(value.to_string());
                }
            });
        }

        let outcome = engine
            .run(
                RunRequest {
                    script: &self.script_text,
                    variables: &self.variables,
                    parameters: &self.parameters,
                    output_variables: &self.output_variables,
                },
                &cancel,
            )
            .await;
        drop(engine);

        match outcome? {
            RunOutcome::Cancelled => Ok(JobOutcome::Cancelled),
            RunOutcome::Completed {
                exit_code,
                output_variables,
            } => Ok(JobOutcome::Completed(ScriptResult {
                exit_code,
                output: std::mem::take(&mut *collected.lock()),
                output_variables,
            })),
        }
    }

    fn serialize_response(writer: &mut WireWriter, response: &ScriptResult) {
        writer.write_optional_i32(response.exit_code);
        writer.write_string_list(&response.output);

        writer.write_length(response.output_variables.len());
        for (name, value) in response.output_variables.iter() {
            writer.write_string(name);
            writer.write_string(value.unwrap_or_default());
        }

        // Trailing field: which of the above were unresolved.
        let unresolved: Vec<&str> = response.output_variables.unresolved().collect();
        writer.write_string_list(&unresolved);
    }

    fn deserialize_response(reader: &mut WireReader<'_>) -> Result<ScriptResult, WireError> {
        let exit_code = reader.read_optional_i32()?;
        let output = reader.read_string_list()?;

        let count = reader.read_count()?;
        let mut output_variables = OutputVariables::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = reader.read_string()?;
            output_variables.insert(name, Some(value));
        }

        // Older agents stop here.
        if !reader.is_exhausted() {
            for name in reader.read_string_list()? {
                output_variables.insert(name, None);
            }
        }

        Ok(ScriptResult {
            exit_code,
            output,
            output_variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{decode_request, decode_response, encode_request, encode_response};

    fn sample_job() -> ExecuteScriptJob {
        ExecuteScriptJob {
            script_text: "param($Count) Write-Output $name".to_string(),
            debug_logging: true,
            verbose_logging: false,
            collect_output: true,
            log_output: false,
            ..Default::default()
        }
        .with_variable("name", "world")
        .with_variable("Name", "case matters for inputs")
        .with_parameter("Count", "3")
        .with_output_variable("Result")
        .with_output_variable("other")
    }

    #[test]
    fn request_round_trip() {
        let job = sample_job();
        let decoded: ExecuteScriptJob = decode_request(&encode_request(&job)).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn empty_request_round_trip() {
        let job = ExecuteScriptJob::default();
        let bytes = encode_request(&job);
        // Empty string, four flags, three empty collections.
        assert_eq!(bytes.len(), 1 + 4 + 3);
        let decoded: ExecuteScriptJob = decode_request(&bytes).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn request_field_order_matches_wire_layout() {
        let job = ExecuteScriptJob {
            script_text: "x".to_string(),
            debug_logging: true,
            verbose_logging: false,
            collect_output: true,
            log_output: false,
            ..Default::default()
        };
        let bytes = encode_request(&job);
        assert_eq!(bytes.as_ref(), &[1, b'x', 1, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn truncated_request_is_malformed() {
        let bytes = encode_request(&sample_job());
        for cut in [0, 1, 5, bytes.len() - 1] {
            assert!(
                decode_request::<ExecuteScriptJob>(&bytes[..cut]).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn response_round_trip_with_exit_code_and_unresolved() {
        let mut vars = OutputVariables::requested(["Result", "Missing"]);
        vars.insert("Result", Some("ok".to_string()));
        let result = ScriptResult {
            exit_code: Some(3),
            output: vec!["line 1".to_string(), "line 2".to_string()],
            output_variables: vars,
        };

        let bytes = encode_response::<ExecuteScriptJob>(&result);
        let decoded = decode_response::<ExecuteScriptJob>(&bytes).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.output_variables.get("result"), Some("ok"));
        assert!(decoded.output_variables.contains("missing"));
        assert_eq!(decoded.output_variables.get("missing"), None);
    }

    #[test]
    fn response_round_trip_empty() {
        let result = ScriptResult::default();
        let bytes = encode_response::<ExecuteScriptJob>(&result);
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0]);
        let decoded = decode_response::<ExecuteScriptJob>(&bytes).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.exit_code, None);
    }

    #[test]
    fn response_without_trailer_reads_as_resolved() {
        // What an agent without the unresolved-names trailer writes.
        let mut writer = WireWriter::new();
        writer.write_optional_i32(Some(0));
        writer.write_length(0);
        writer.write_length(1);
        writer.write_string("Result");
        writer.write_string("");
        let bytes = writer.into_bytes();

        let decoded = decode_response::<ExecuteScriptJob>(&bytes).unwrap();
        assert_eq!(decoded.exit_code, Some(0));
        assert_eq!(decoded.output_variables.get("Result"), Some(""));
    }

    #[test]
    fn truncated_exit_code_is_malformed() {
        let bytes = [1u8, 0, 0];
        assert!(matches!(
            decode_response::<ExecuteScriptJob>(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }
}
