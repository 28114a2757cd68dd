//! End-to-end tests against a real `pwsh`. Skipped when it is not installed.


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use script_agent::config::HostConfig;
use script_agent::error::JobError;
use script_agent::host::PwshHost;
use script_agent::job::{JobOutcome, MessageLevel, RemoteJob};
use script_agent::script::ExecuteScriptJob;
use script_agent::service::ServiceStatus;
use test_harness::{drain_log, test_context, FakeServiceManager};

fn pwsh_available() -> bool {
    std::process::Command::new("pwsh")
        .args(["-NoLogo", "-NoProfile", "-Command", "exit 0"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

macro_rules! require_pwsh {
    () => {
        if !pwsh_available() {
            eprintln!("pwsh not found, skipping");
            return;
        }
    };
}

fn pwsh_context() -> (
    script_agent::job::JobContext,
    tokio::sync::mpsc::UnboundedReceiver<script_agent::job::LogMessage>,
) {
    test_context(
        Arc::new(PwshHost::new(HostConfig::default())),
        Arc::new(FakeServiceManager::new(ServiceStatus::Stopped)),
    )
}

#[tokio::test]
async fn test_pwsh_output_variables_and_exit_code() {
    require_pwsh!();
    let (ctx, _log) = pwsh_context();
    let job = ExecuteScriptJob {
        collect_output: true,
        ..ExecuteScriptJob::new(
            "param($Count)\n\"Hello $Name\"\n\"Count=$Count\"\n$Answer = 6 * 7\nexit 4",
        )
    }
    .with_variable("Name", "World")
    .with_parameter("Count", "3")
    .with_output_variable("Answer")
    .with_output_variable("NeverSet");

    let result = job
        .execute(&ctx, CancellationToken::new())
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(result.exit_code, Some(4));
    assert_eq!(result.output, vec!["Hello World".to_string(), "Count=3".to_string()]);
    assert_eq!(result.output_variables.get("Answer"), Some("42"));
    assert!(result.output_variables.contains("NeverSet"));
    assert_eq!(result.output_variables.get("NeverSet"), None);
}

#[tokio::test]
async fn test_pwsh_no_exit_code_without_exit() {
    require_pwsh!();
    let (ctx, _log) = pwsh_context();

    let result = ExecuteScriptJob::new("Write-Output 'done'")
        .execute(&ctx, CancellationToken::new())
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_pwsh_warning_stream_logged() {
    require_pwsh!();
    let (ctx, mut log) = pwsh_context();

    ExecuteScriptJob::new("Write-Warning 'low disk'")
        .execute(&ctx, CancellationToken::new())
        .await
        .unwrap();

    let messages = drain_log(&mut log);
    assert!(messages
        .iter()
        .any(|m| m.level == MessageLevel::Warning && m.message == "low disk"));
}

#[tokio::test]
async fn test_pwsh_streams_keep_their_order() {
    require_pwsh!();
    let (ctx, mut log) = pwsh_context();
    let job = ExecuteScriptJob {
        collect_output: true,
        log_output: true,
        ..ExecuteScriptJob::new(
            "Write-Output @{a=1}\nWrite-Output 'first'\nWrite-Error 'second'\n\
             Write-Warning 'third'\nWrite-Output 'WARNING: fourth'",
        )
    };

    let result = job
        .execute(&ctx, CancellationToken::new())
        .await
        .unwrap()
        .completed()
        .unwrap();

    // One line per object, whatever its formatted shape.
    assert_eq!(
        result.output,
        vec![
            "System.Collections.Hashtable".to_string(),
            "first".to_string(),
            "WARNING: fourth".to_string(),
        ]
    );
    let messages: Vec<(MessageLevel, String)> = drain_log(&mut log)
        .into_iter()
        .filter(|m| m.level != MessageLevel::Debug)
        .map(|m| (m.level, m.message))
        .collect();
    assert_eq!(
        messages,
        vec![
            (MessageLevel::Information, "System.Collections.Hashtable".to_string()),
            (MessageLevel::Information, "first".to_string()),
            (MessageLevel::Error, "second".to_string()),
            (MessageLevel::Warning, "third".to_string()),
            (MessageLevel::Information, "WARNING: fourth".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_pwsh_runtime_error_fails_job() {
    require_pwsh!();
    let (ctx, _log) = pwsh_context();

    let err = ExecuteScriptJob::new("throw 'bad things'")
        .execute(&ctx, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Host(_)));
    assert!(err.to_string().contains("bad things"));
}

#[tokio::test]
async fn test_pwsh_cancel_is_prompt() {
    require_pwsh!();
    let (ctx, _log) = pwsh_context();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        ExecuteScriptJob::new("Start-Sleep -Seconds 120").execute(&ctx, cancel),
    )
    .await
    .expect("cancellation should not wait for the script")
    .unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled);
}
