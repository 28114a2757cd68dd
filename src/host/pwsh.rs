//! PowerShell host backed by a `pwsh` process per invocation.
//!
//! A session keeps its variable namespace on this side and a scratch
//! directory on disk. Each invocation renders a wrapper script that imports
//! the namespace, dot-sources the user script with its parameters splatted by
//! name, and always writes a JSON report from a `finally` block: whether the
//! script completed, the text of a terminating error, and the exported
//! variables. A run that neither completed nor failed asked to `exit`, and the
//! process exit status carries the code.
//!
//! The wrapper merges every stream of the user script into one pipeline and
//! writes each record to stdout as a single line: a record-separator marker
//! followed by compact JSON naming the stream and the record's text. One
//! object is one line, so order across streams survives the pipe. Unmarked
//! stdout lines were written straight to the console and count as output;
//! stderr only carries the interpreter's own diagnostics.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{HostEvent, HostEventSender, Invocation, ScriptHost, Session};
use crate::config::HostConfig;
use crate::error::HostError;
use crate::job::MessageLevel;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Leads every record line the wrapper writes.
const RECORD_MARKER: char = '\u{1e}';

#[derive(Debug, Deserialize)]
struct StreamRecord {
    stream: RecordStream,
    text: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordStream {
    Output,
    Error,
    Warning,
    Verbose,
    Debug,
    Information,
}

#[derive(Debug, Clone)]
pub struct PwshHost {
    config: HostConfig,
}

impl PwshHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ScriptHost for PwshHost {
    async fn open_session(&self) -> Result<Box<dyn Session>, HostError> {
        let scratch = tempfile::Builder::new()
            .prefix("script-agent-")
            .tempdir()
            .map_err(HostError::Io)?;
        tracing::debug!(path = %scratch.path().display(), "Opened PowerShell session");
        Ok(Box::new(PwshSession {
            config: self.config.clone(),
            scratch: Some(scratch),
            variables: HashMap::new(),
        }))
    }
}

struct PwshSession {
    config: HostConfig,
    scratch: Option<TempDir>,
    /// Keyed by lowercased name; PowerShell variable names are case-insensitive.
    variables: HashMap<String, (String, String)>,
}

#[derive(Debug, Deserialize)]
struct Report {
    completed: bool,
    failed: Option<String>,
    #[serde(default)]
    variables: HashMap<String, Option<String>>,
}

#[async_trait]
impl Session for PwshSession {
    fn set_variable(&mut self, name: &str, value: &str) {
        self.variables
            .insert(name.to_lowercase(), (name.to_string(), value.to_string()));
    }

    fn get_variable(&self, name: &str) -> Option<String> {
        self.variables
            .get(&name.to_lowercase())
            .map(|(_, value)| value.clone())
    }

    async fn invoke(
        &mut self,
        invocation: Invocation<'_>,
        events: HostEventSender,
        stop: CancellationToken,
    ) -> Result<(), HostError> {
        let scratch = self
            .scratch
            .as_ref()
            .ok_or(HostError::SessionDisposed)?
            .path()
            .to_path_buf();

        let id = Uuid::new_v4();
        let script_path = scratch.join(format!("{id}.script.ps1"));
        let wrapper_path = scratch.join(format!("{id}.wrapper.ps1"));
        let report_path = scratch.join(format!("{id}.report.json"));

        let wrapper = render_wrapper(
            self.variables.values(),
            invocation.parameters,
            invocation.exports,
            &script_path,
            &report_path,
        );
        tokio::fs::write(&script_path, invocation.script).await?;
        tokio::fs::write(&wrapper_path, wrapper).await?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg("-OutputFormat")
            .arg("Text")
            .arg("-File")
            .arg(&wrapper_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HostError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Protocol("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HostError::Protocol("stderr not captured".to_string()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => {
                        let _ = events.send(classify_stdout(line));
                    }
                    None => out_open = false,
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let _ = events.send(HostEvent::Log(MessageLevel::Error, line));
                    }
                    None => err_open = false,
                },
                _ = stop.cancelled() => {
                    tracing::debug!(pid = ?child.id(), "Stopping PowerShell invocation");
                    child.start_kill()?;
                    child.wait().await?;
                    remove_files(&[&script_path, &wrapper_path, &report_path]).await;
                    return Ok(());
                }
            }
        }

        let status = child.wait().await?;
        let report = read_report(&report_path).await;
        remove_files(&[&script_path, &wrapper_path, &report_path]).await;
        let report = report.map_err(|e| {
            HostError::Protocol(format!("interpreter exited with {status} without a report: {e}"))
        })?;

        for (name, value) in report.variables {
            match value {
                Some(value) => self.set_variable(&name, &value),
                None => {
                    self.variables.remove(&name.to_lowercase());
                }
            }
        }

        if let Some(message) = report.failed {
            return Err(HostError::ScriptFailed(message));
        }
        if !report.completed {
            let _ = events.send(HostEvent::ShouldExit(status.code().unwrap_or(-1)));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.variables.clear();
        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove session directory"
                );
            }
        }
    }
}

async fn read_report(path: &Path) -> Result<Report, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
    serde_json::from_slice(body).map_err(|e| e.to_string())
}

async fn remove_files(paths: &[&Path]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

fn classify_stdout(line: String) -> HostEvent {
    let Some(body) = line.strip_prefix(RECORD_MARKER) else {
        return HostEvent::Output(line);
    };
    match serde_json::from_str::<StreamRecord>(body) {
        Ok(StreamRecord { stream, text }) => match stream {
            RecordStream::Output => HostEvent::Output(text),
            RecordStream::Error => HostEvent::Log(MessageLevel::Error, text),
            RecordStream::Warning => HostEvent::Log(MessageLevel::Warning, text),
            RecordStream::Verbose | RecordStream::Debug => {
                HostEvent::Log(MessageLevel::Debug, text)
            }
            RecordStream::Information => HostEvent::Log(MessageLevel::Information, text),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable stream record");
            HostEvent::Output(body.to_string())
        }
    }
}

/// Quote text as a PowerShell single-quoted literal.
///
/// PowerShell accepts the typographic single quotes as delimiters too, so
/// every one of them is doubled.
fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

fn render_wrapper<'a>(
    variables: impl IntoIterator<Item = &'a (String, String)>,
    parameters: &HashMap<String, String>,
    exports: &[String],
    script_path: &Path,
    report_path: &Path,
) -> String {
    let mut out = String::new();
    out.push_str("using namespace System.Management.Automation\n");
    out.push_str("$ErrorActionPreference = 'Continue'\n");
    out.push_str("$ProgressPreference = 'SilentlyContinue'\n");
    out.push_str("if ($PSStyle) { $PSStyle.OutputRendering = 'PlainText' }\n");

    for (name, value) in variables {
        let _ = writeln!(out, "Set-Variable -Name {} -Value {}", quote(name), quote(value));
    }

    out.push_str("$__scriptAgentParameters = @{\n");
    for (name, value) in parameters {
        let _ = writeln!(out, "    {} = {}", quote(name), quote(value));
    }
    out.push_str("}\n");

    let exports: Vec<String> = exports.iter().map(|name| quote(name)).collect();
    let _ = writeln!(out, "$__scriptAgentExports = @({})", exports.join(", "));

    let script_path = quote(&script_path.to_string_lossy());
    let report_path = quote(&report_path.to_string_lossy());
    let _ = write!(
        out,
        r#"$__scriptAgentReport = @{{ completed = $false; failed = $null; variables = @{{}} }}
function __scriptAgentEmit([string]$Stream, [string]$Text) {{
    $__scriptAgentRecord = [ordered]@{{ stream = $Stream; text = $Text }}
    $__scriptAgentJson = ConvertTo-Json -InputObject $__scriptAgentRecord -Compress
    [Console]::Out.WriteLine([string][char]0x1E + $__scriptAgentJson)
}}
try {{
    $__scriptAgentBlock = [ScriptBlock]::Create([System.IO.File]::ReadAllText({script_path}))
    . $__scriptAgentBlock @__scriptAgentParameters *>&1 | ForEach-Object {{
        if ($_ -is [ErrorRecord]) {{ __scriptAgentEmit 'error' $_.ToString() }}
        elseif ($_ -is [WarningRecord]) {{ __scriptAgentEmit 'warning' $_.Message }}
        elseif ($_ -is [VerboseRecord]) {{ __scriptAgentEmit 'verbose' $_.Message }}
        elseif ($_ -is [DebugRecord]) {{ __scriptAgentEmit 'debug' $_.Message }}
        elseif ($_ -is [InformationRecord]) {{
            __scriptAgentEmit 'information' "$($_.MessageData)"
        }}
        elseif ($null -eq $_) {{ __scriptAgentEmit 'output' '' }}
        else {{ __scriptAgentEmit 'output' $_.ToString() }}
    }}
    $__scriptAgentReport.completed = $true
}}
catch {{
    $__scriptAgentReport.failed = $_.ToString()
}}
finally {{
    foreach ($__scriptAgentName in $__scriptAgentExports) {{
        $__scriptAgentVariable = Get-Variable -Name $__scriptAgentName -ErrorAction SilentlyContinue
        if ($null -ne $__scriptAgentVariable -and $null -ne $__scriptAgentVariable.Value) {{
            $__scriptAgentReport.variables[$__scriptAgentName] = "$($__scriptAgentVariable.Value)"
        }} else {{
            $__scriptAgentReport.variables[$__scriptAgentName] = $null
        }}
    }}
    $__scriptAgentJson = ConvertTo-Json -InputObject $__scriptAgentReport -Compress -Depth 3
    [System.IO.File]::WriteAllText({report_path}, $__scriptAgentJson)
}}
"#
    );
    out
}
