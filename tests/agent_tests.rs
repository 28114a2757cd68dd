
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use script_agent::agent::{AgentClient, Frame, RejectReason};
use script_agent::config::ClientConfig;
use script_agent::error::DispatchError;
use script_agent::job::{encode_request, JobKind, JobOutcome, LogMessage, MessageLevel};
use script_agent::script::ExecuteScriptJob;
use script_agent::service::{ControlServiceJob, ServiceStatus};
use test_harness::{assert_eventually, spawn_agent, FakeHost, FakeServiceManager, TestAgent};

async fn start_agent(host: &FakeHost) -> TestAgent {
    let services = Arc::new(FakeServiceManager::new(ServiceStatus::Stopped));
    spawn_agent(Arc::new(host.clone()), services, 4).await
}

async fn raw_connect(agent: &TestAgent) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(
        TcpStream::connect(agent.addr).await.unwrap(),
        LengthDelimitedCodec::new(),
    )
}

async fn next_frame(framed: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Frame {
    let bytes = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("agent should answer")
        .expect("connection closed")
        .unwrap();
    Frame::decode(&bytes).unwrap()
}

#[tokio::test]
async fn test_script_round_trip() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let job = ExecuteScriptJob {
        collect_output: true,
        log_output: true,
        ..ExecuteScriptJob::new("output hello\nlog warn careful\nset Answer 42\nexit 3")
    }
    .with_output_variable("Answer")
    .with_output_variable("Missing");

    let mut logs = Vec::new();
    let outcome = agent
        .client()
        .execute(&job, &CancellationToken::new(), |m| logs.push(m))
        .await
        .unwrap();

    let result = outcome.completed().expect("job should complete");
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.output, vec!["hello".to_string()]);
    assert_eq!(result.output_variables.get("Answer"), Some("42"));
    assert!(result.output_variables.contains("Missing"));
    assert_eq!(result.output_variables.get("Missing"), None);
    assert_eq!(
        logs,
        vec![
            LogMessage {
                level: MessageLevel::Information,
                message: "hello".to_string(),
            },
            LogMessage {
                level: MessageLevel::Warning,
                message: "careful".to_string(),
            },
        ]
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_service_job_round_trip() {
    let services = Arc::new(FakeServiceManager::new(ServiceStatus::Stopped));
    let agent = spawn_agent(Arc::new(FakeHost::new()), services.clone(), 4).await;

    let mut logs = Vec::new();
    let outcome = agent
        .client()
        .execute(
            &ControlServiceJob::start("web", true),
            &CancellationToken::new(),
            |m| logs.push(m.message),
        )
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::Completed(()));
    assert_eq!(services.starts(), 1);
    assert_eq!(logs, vec!["Service is running.".to_string()]);

    agent.stop().await;
}

#[tokio::test]
async fn test_execution_failure_is_not_cancellation() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;

    let err = agent
        .client()
        .execute(
            &ExecuteScriptJob::new("fail Cannot find path"),
            &CancellationToken::new(),
            |_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Execution(ref msg) if msg.contains("Cannot find path")));

    agent.stop().await;
}

#[tokio::test]
async fn test_caller_cancel_stops_job_on_agent() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        agent
            .client()
            .execute(&ExecuteScriptJob::new("sleep 60000"), &cancel, |_| {}),
    )
    .await
    .expect("cancel should return promptly")
    .unwrap();
    assert!(outcome.is_cancelled());

    let stats = host.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.stopped.load(std::sync::atomic::Ordering::SeqCst) }
        },
        Duration::from_secs(5),
        "agent should stop the script",
    )
    .await;
    assert_eventually(
        || {
            let host = host.clone();
            async move { host.closed() == 1 }
        },
        Duration::from_secs(5),
        "agent should release the session",
    )
    .await;

    agent.stop().await;
}

#[tokio::test]
async fn test_cancel_frame_answered_with_cancelled() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let mut framed = raw_connect(&agent).await;

    let job = ExecuteScriptJob {
        log_output: true,
        ..ExecuteScriptJob::new("output started\nsleep 60000")
    };
    framed
        .send(
            Frame::Dispatch {
                kind: JobKind::ExecuteScript,
                payload: encode_request(&job),
            }
            .encode(),
        )
        .await
        .unwrap();

    // Wait until the script is running before cancelling.
    assert!(matches!(next_frame(&mut framed).await, Frame::Log(ref m) if m.message == "started"));
    framed.send(Frame::Cancel.encode()).await.unwrap();

    assert_eq!(next_frame(&mut framed).await, Frame::Cancelled);
    assert!(host.was_stopped());

    agent.stop().await;
}

#[tokio::test]
async fn test_disconnect_cancels_job() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let mut framed = raw_connect(&agent).await;

    let job = ExecuteScriptJob {
        log_output: true,
        ..ExecuteScriptJob::new("output started\nsleep 60000")
    };
    framed
        .send(
            Frame::Dispatch {
                kind: JobKind::ExecuteScript,
                payload: encode_request(&job),
            }
            .encode(),
        )
        .await
        .unwrap();
    next_frame(&mut framed).await;
    drop(framed);

    let stats = host.stats.clone();
    assert_eventually(
        || {
            let stats = stats.clone();
            async move { stats.stopped.load(std::sync::atomic::Ordering::SeqCst) }
        },
        Duration::from_secs(5),
        "disconnect should stop the script",
    )
    .await;

    agent.stop().await;
}

#[tokio::test]
async fn test_unknown_job_kind_rejected() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let mut framed = raw_connect(&agent).await;

    framed.send(Bytes::from_static(&[0x01, 0x63, 0x00])).await.unwrap();

    let Frame::Rejected(reason, message) = next_frame(&mut framed).await else {
        panic!("expected a rejection");
    };
    assert_eq!(reason, RejectReason::MalformedPayload);
    assert!(message.contains("unknown job kind 99"));
    assert_eq!(host.opened(), 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_truncated_payload_rejected() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let mut framed = raw_connect(&agent).await;

    let payload = encode_request(&ExecuteScriptJob::new("output hello"));
    framed
        .send(
            Frame::Dispatch {
                kind: JobKind::ExecuteScript,
                payload: payload.slice(..payload.len() - 3),
            }
            .encode(),
        )
        .await
        .unwrap();

    let Frame::Rejected(reason, message) = next_frame(&mut framed).await else {
        panic!("expected a rejection");
    };
    assert_eq!(reason, RejectReason::MalformedPayload);
    assert!(message.starts_with("malformed job payload"));
    assert_eq!(host.invocations(), 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_oversized_first_frame_rejected() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let mut stream = TcpStream::connect(agent.addr).await.unwrap();

    // A length prefix far beyond the agent's limit, with no body behind it.
    stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let frame = next_frame(&mut framed).await;
    assert!(matches!(frame, Frame::Rejected(RejectReason::FrameTooLarge, _)));
    assert_eq!(host.opened(), 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_rejection_reaches_caller_with_its_reason() {
    // Stands in for an agent that cannot read what it was sent.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        framed.next().await;
        let rejected = Frame::Rejected(
            RejectReason::MalformedPayload,
            "malformed job payload: unknown job kind 1".to_string(),
        );
        framed.send(rejected.encode()).await.unwrap();
    });

    let client = AgentClient::new(ClientConfig::new(addr.to_string()));
    let err = client
        .execute(&ExecuteScriptJob::new("output x"), &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Rejected {
            reason: RejectReason::MalformedPayload,
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrent_jobs_keep_their_own_logs() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let client = agent.client();

    let job_a = ExecuteScriptJob {
        log_output: true,
        ..ExecuteScriptJob::new("output a1\nsleep 20\noutput a2\nsleep 20\noutput a3")
    };
    let job_b = ExecuteScriptJob {
        log_output: true,
        ..ExecuteScriptJob::new("output b1\nsleep 15\noutput b2\nsleep 15\noutput b3")
    };

    let mut logs_a = Vec::new();
    let mut logs_b = Vec::new();
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        client.execute(&job_a, &cancel, |m| logs_a.push(m.message)),
        client.execute(&job_b, &cancel, |m| logs_b.push(m.message)),
    );

    assert!(a.unwrap().completed().is_some());
    assert!(b.unwrap().completed().is_some());
    assert_eq!(logs_a, vec!["a1", "a2", "a3"]);
    assert_eq!(logs_b, vec!["b1", "b2", "b3"]);
    assert_eq!(host.opened(), 2);

    agent.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let host = FakeHost::new();
    let agent = start_agent(&host).await;
    let client = agent.client();
    let shutdown = agent.shutdown.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.execute(
            &ExecuteScriptJob::new("sleep 60000"),
            &CancellationToken::new(),
            |_| {},
        ),
    )
    .await
    .expect("shutdown should end the job")
    .unwrap();

    assert_eq!(outcome, JobOutcome::Cancelled);
    agent.stop().await;
}

#[tokio::test]
async fn test_unreachable_agent_is_transport_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = AgentClient::new(ClientConfig::new(addr.to_string()));
    let err = client
        .execute(&ExecuteScriptJob::new("output x"), &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Io(_)));
}
