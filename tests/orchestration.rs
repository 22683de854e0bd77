// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests for the commander/worker IPC channel and the supervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use platoon::agent::{AgentError, AgentHooks, AgentOutcome, ConfirmationResult, ToolConfirmation, WorkerAgent};
use platoon::ipc::{
    encode, OrchestrationClient, OrchestrationServer, PermissionDecision, ServerConfig,
    ServerEvent, StatusKind, WorkerMessage,
};
use platoon::supervisor::ChildSupervisor;
use platoon::types::{WorkerConfig, WorkerHello};

const WAIT: Duration = Duration::from_secs(5);

fn hello(worker_id: &str) -> WorkerHello {
    WorkerHello {
        worker_id: worker_id.to_string(),
        worktree: PathBuf::from("/tmp/wt"),
        branch: worker_id.to_string(),
        task: "do X".to_string(),
        model: None,
        provider: None,
    }
}

async fn started_server(
    socket: &std::path::Path,
    config: ServerConfig,
) -> (OrchestrationServer, mpsc::Receiver<ServerEvent>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut server = OrchestrationServer::with_config(socket, config);
    let events = server.take_events().expect("events already taken");
    server.start().await.expect("server start failed");
    (server, events)
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn handshake_then_status_update() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (_server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let client = OrchestrationClient::new(&socket, "w1");
    let session = client.connect(&hello("w1")).await.expect("connect failed");
    assert!(session.auto_approve.is_empty());

    match next_event(&mut events).await {
        ServerEvent::WorkerConnected {
            worker_id,
            branch,
            task,
            ..
        } => {
            assert_eq!(worker_id, "w1");
            assert_eq!(branch, "w1");
            assert_eq!(task, "do X");
        }
        other => panic!("expected WorkerConnected, got {other:?}"),
    }

    client
        .send_status(StatusKind::Thinking, None)
        .await
        .expect("status send failed");

    match next_event(&mut events).await {
        ServerEvent::StatusChanged {
            worker_id, status, ..
        } => {
            assert_eq!(worker_id, "w1");
            assert_eq!(status, StatusKind::Thinking);
        }
        other => panic!("expected StatusChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn permission_round_trip_approve() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let client = Arc::new(OrchestrationClient::new(&socket, "w1"));
    client.connect(&hello("w1")).await.expect("connect failed");
    next_event(&mut events).await; // WorkerConnected

    let requester = Arc::clone(&client);
    let request = tokio::spawn(async move {
        let confirmation = ToolConfirmation::new("bash", serde_json::json!({"command": "ls"}));
        requester.request_permission(&confirmation).await
    });

    match next_event(&mut events).await {
        ServerEvent::PermissionRequested {
            worker_id,
            request_id,
            confirmation,
        } => {
            assert_eq!(worker_id, "w1");
            assert_eq!(confirmation.tool_name, "bash");
            assert!(
                server
                    .respond("w1", &request_id, PermissionDecision::Approve)
                    .await
            );
        }
        other => panic!("expected PermissionRequested, got {other:?}"),
    }

    let decision = timeout(WAIT, request)
        .await
        .expect("request timed out")
        .expect("request task panicked")
        .expect("request failed");
    assert_eq!(decision, PermissionDecision::Approve);
}

#[tokio::test]
async fn cancel_short_circuits_pending_and_future_requests() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let client = Arc::new(OrchestrationClient::new(&socket, "w1"));
    client.connect(&hello("w1")).await.expect("connect failed");
    next_event(&mut events).await; // WorkerConnected

    let requester = Arc::clone(&client);
    let in_flight = tokio::spawn(async move {
        let confirmation = ToolConfirmation::new("bash", serde_json::json!({"command": "ls"}));
        requester.request_permission(&confirmation).await
    });
    next_event(&mut events).await; // PermissionRequested

    assert!(
        server
            .send(
                "w1",
                &platoon::ipc::CommanderMessage::cancel(Some("shutting down".to_string())),
            )
            .await
    );

    // The in-flight request is resolved with abort by the cancel.
    let decision = timeout(WAIT, in_flight)
        .await
        .expect("request timed out")
        .expect("request task panicked")
        .expect("request failed");
    assert_eq!(decision, PermissionDecision::Abort);
    assert!(client.is_cancelled());

    // Subsequent requests abort locally, without a wire round trip.
    let confirmation = ToolConfirmation::new("bash", serde_json::json!({"command": "pwd"}));
    let decision = client
        .request_permission(&confirmation)
        .await
        .expect("request failed");
    assert_eq!(decision, PermissionDecision::Abort);
}

#[tokio::test]
async fn idle_connection_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let config = ServerConfig {
        sweep_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(150),
        ..ServerConfig::default()
    };
    let (server, mut events) = started_server(&socket, config).await;

    // A raw peer that handshakes and then never answers anything, not even
    // the server's pings.
    let mut stream = UnixStream::connect(&socket).await.unwrap();
    let handshake = encode(&WorkerMessage::handshake(&hello("silent"))).unwrap();
    stream.write_all(handshake.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    match next_event(&mut events).await {
        ServerEvent::WorkerConnected { worker_id, .. } => assert_eq!(worker_id, "silent"),
        other => panic!("expected WorkerConnected, got {other:?}"),
    }
    assert!(server.is_connected("silent").await);

    match next_event(&mut events).await {
        ServerEvent::WorkerDisconnected { worker_id } => assert_eq!(worker_id, "silent"),
        other => panic!("expected WorkerDisconnected, got {other:?}"),
    }
    assert!(!server.is_connected("silent").await);
}

#[tokio::test]
async fn responsive_client_survives_sweeps() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let config = ServerConfig {
        sweep_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(150),
        ..ServerConfig::default()
    };
    let (server, mut events) = started_server(&socket, config).await;

    // The real client answers pings automatically.
    let client = OrchestrationClient::new(&socket, "w1");
    client.connect(&hello("w1")).await.expect("connect failed");
    next_event(&mut events).await; // WorkerConnected

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(server.is_connected("w1").await);
    assert!(client.is_connected());
}

#[tokio::test]
async fn duplicate_handshake_evicts_prior_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let first = OrchestrationClient::new(&socket, "w1");
    first.connect(&hello("w1")).await.expect("connect failed");
    next_event(&mut events).await; // WorkerConnected(w1)

    let second = OrchestrationClient::new(&socket, "w1");
    second.connect(&hello("w1")).await.expect("reconnect failed");

    // The prior connection is dropped and announced before the new identity
    // is registered.
    match next_event(&mut events).await {
        ServerEvent::WorkerDisconnected { worker_id } => assert_eq!(worker_id, "w1"),
        other => panic!("expected WorkerDisconnected, got {other:?}"),
    }
    match next_event(&mut events).await {
        ServerEvent::WorkerConnected { worker_id, .. } => assert_eq!(worker_id, "w1"),
        other => panic!("expected WorkerConnected, got {other:?}"),
    }
    assert!(server.is_connected("w1").await);

    // The survivor still has a working channel.
    second
        .send_status(StatusKind::Thinking, None)
        .await
        .expect("status send failed");
    match next_event(&mut events).await {
        ServerEvent::StatusChanged { status, .. } => assert_eq!(status, StatusKind::Thinking),
        other => panic!("expected StatusChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn pre_handshake_messages_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (_server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let mut stream = UnixStream::connect(&socket).await.unwrap();
    let status = encode(&WorkerMessage::status_update(
        "ghost",
        StatusKind::Thinking,
        None,
    ))
    .unwrap();
    stream.write_all(status.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    // No event may fire for an anonymous connection's traffic.
    let got = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(got.is_err(), "anonymous message produced an event: {got:?}");
}

#[tokio::test]
async fn handshake_identity_wins_over_payload_claims() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (_server, mut events) = started_server(&socket, ServerConfig::default()).await;

    let mut stream = UnixStream::connect(&socket).await.unwrap();
    let handshake = encode(&WorkerMessage::handshake(&hello("honest"))).unwrap();
    stream.write_all(handshake.as_bytes()).await.unwrap();

    // Claim to be someone else in the payload.
    let status = encode(&WorkerMessage::status_update(
        "impostor",
        StatusKind::Thinking,
        None,
    ))
    .unwrap();
    stream.write_all(status.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    next_event(&mut events).await; // WorkerConnected(honest)
    match next_event(&mut events).await {
        ServerEvent::StatusChanged { worker_id, .. } => assert_eq!(worker_id, "honest"),
        other => panic!("expected StatusChanged, got {other:?}"),
    }
}

// ============================================================================
// Supervisor end-to-end
// ============================================================================

/// Scripted agent: emits one text chunk, runs one tool through the
/// confirmation hook, and succeeds or fails based on the decision.
struct ScriptedAgent {
    dangerous: bool,
}

#[async_trait]
impl WorkerAgent for ScriptedAgent {
    async fn run_task(&self, task: &str, hooks: AgentHooks) -> Result<AgentOutcome, AgentError> {
        if let Some(on_text) = &hooks.on_text {
            on_text(&format!("working on: {task}"));
        }

        let input = serde_json::json!({"command": "cargo test"});
        if let Some(on_tool_call) = &hooks.on_tool_call {
            on_tool_call("bash", &input);
        }

        let mut confirmation = ToolConfirmation::new("bash", input);
        if self.dangerous {
            confirmation = confirmation.dangerous("runs arbitrary commands");
        }
        let decision = match &hooks.on_confirm {
            Some(on_confirm) => on_confirm(confirmation).await,
            None => ConfirmationResult::Approve,
        };

        match decision {
            ConfirmationResult::Approve => Ok(AgentOutcome {
                response: "all tests pass".to_string(),
                tokens_used: Default::default(),
            }),
            ConfirmationResult::Deny => Err(AgentError::TaskFailed("tool denied".to_string())),
            ConfirmationResult::Abort => {
                Err(AgentError::Interrupted("task aborted".to_string()))
            }
        }
    }

    fn inject_context(&self, _context: &str) {}
}

#[tokio::test]
async fn supervisor_full_run_with_approval() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;
    let server = Arc::new(server);

    // Commander loop: approve everything.
    let approver = Arc::clone(&server);
    let (result_tx, mut result_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::PermissionRequested {
                    worker_id,
                    request_id,
                    ..
                } => {
                    approver
                        .respond(&worker_id, &request_id, PermissionDecision::Approve)
                        .await;
                }
                ServerEvent::TaskCompleted { result, .. } => {
                    let _ = result_tx.send(result).await;
                }
                _ => {}
            }
        }
    });

    let config = WorkerConfig::new("w1", "feat/tests", "run the test suite");
    let supervisor = ChildSupervisor::new(&socket, config, dir.path());
    let result = supervisor.run(Arc::new(ScriptedAgent { dangerous: false })).await;

    assert!(result.success);
    assert_eq!(result.response, "all tests pass");
    assert_eq!(result.tool_call_count, 1);
    assert_eq!(result.exit_code(), 0);

    // The commander saw the same result arrive over the wire.
    let reported = timeout(WAIT, result_rx.recv())
        .await
        .expect("timed out waiting for task_complete")
        .expect("commander loop gone");
    assert!(reported.success);
    assert_eq!(reported.response, "all tests pass");
    assert_eq!(reported.worker_id, "w1");
}

#[tokio::test]
async fn supervisor_denied_tool_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;
    let server = Arc::new(server);

    let denier = Arc::clone(&server);
    let (failure_tx, mut failure_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::PermissionRequested {
                    worker_id,
                    request_id,
                    ..
                } => {
                    denier
                        .respond(
                            &worker_id,
                            &request_id,
                            PermissionDecision::Deny {
                                reason: Some("not in this sandbox".to_string()),
                            },
                        )
                        .await;
                }
                ServerEvent::TaskFailed { error, .. } => {
                    let _ = failure_tx.send(error).await;
                }
                _ => {}
            }
        }
    });

    let config = WorkerConfig::new("w2", "feat/denied", "run something risky");
    let supervisor = ChildSupervisor::new(&socket, config, dir.path());
    let result = supervisor.run(Arc::new(ScriptedAgent { dangerous: true })).await;

    assert!(!result.success);
    assert_eq!(result.exit_code(), 1);

    let failure = timeout(WAIT, failure_rx.recv())
        .await
        .expect("timed out waiting for task_error")
        .expect("commander loop gone");
    assert!(failure.message.contains("tool denied"));
    assert!(!failure.recoverable);
}

#[tokio::test]
async fn supervisor_permission_timeout_degrades_to_deny() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    // Hand the worker a tiny permission timeout and then never answer.
    let config = ServerConfig {
        permission_timeout_ms: Some(100),
        ..ServerConfig::default()
    };
    let (server, mut events) = started_server(&socket, config).await;
    let server = Arc::new(server);

    let (failure_tx, mut failure_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::TaskFailed { error, .. } = event {
                let _ = failure_tx.send(error).await;
            }
        }
    });

    let worker = WorkerConfig::new("w6", "feat/silent", "run something risky");
    let supervisor = ChildSupervisor::new(&socket, worker, dir.path());
    let result = supervisor.run(Arc::new(ScriptedAgent { dangerous: true })).await;

    // The unanswered request denies the tool; it never silently approves.
    assert!(!result.success);

    let failure = timeout(WAIT, failure_rx.recv())
        .await
        .expect("timed out waiting for task_error")
        .expect("commander loop gone");
    assert!(failure.message.contains("tool denied"));
    drop(server);
}

#[tokio::test]
async fn supervisor_auto_approve_skips_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let config = ServerConfig {
        auto_approve: vec!["bash".to_string()],
        ..ServerConfig::default()
    };
    let (_server, mut events) = started_server(&socket, config).await;

    let worker = WorkerConfig::new("w3", "feat/auto", "run the tests");
    let supervisor = ChildSupervisor::new(&socket, worker, dir.path());
    let result = supervisor.run(Arc::new(ScriptedAgent { dangerous: false })).await;
    assert!(result.success);

    // Drain events; no permission request may appear.
    loop {
        match timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Some(ServerEvent::PermissionRequested { .. })) => {
                panic!("auto-approved tool still went over the wire");
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
}

#[tokio::test]
async fn status_sequence_over_the_wire() {
    // Drive a supervisor run and observe the status traffic through the
    // server's event stream: starting, thinking, tool_call, waiting, thinking.
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;
    let server = Arc::new(server);

    let approver = Arc::clone(&server);
    let (status_tx, mut status_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::PermissionRequested {
                    worker_id,
                    request_id,
                    ..
                } => {
                    approver
                        .respond(&worker_id, &request_id, PermissionDecision::Approve)
                        .await;
                }
                ServerEvent::StatusChanged { status, .. } => {
                    let _ = status_tx.send(status).await;
                }
                _ => {}
            }
        }
    });

    let config = WorkerConfig::new("w4", "feat/seq", "task");
    let supervisor = ChildSupervisor::new(&socket, config, dir.path());
    let result = supervisor.run(Arc::new(ScriptedAgent { dangerous: true })).await;
    assert!(result.success);

    let mut seen = Vec::new();
    while let Ok(Some(status)) = timeout(Duration::from_millis(300), status_rx.recv()).await {
        seen.push(status);
    }

    assert_eq!(seen.first(), Some(&StatusKind::Starting));
    assert!(seen.contains(&StatusKind::WaitingPermission {
        tool: "bash".to_string()
    }));
    assert_eq!(seen.last(), Some(&StatusKind::Complete));
    // waiting_permission resolves back to thinking before completion.
    let waiting_pos = seen
        .iter()
        .position(|s| matches!(s, StatusKind::WaitingPermission { .. }))
        .unwrap();
    assert!(seen[waiting_pos + 1..].contains(&StatusKind::Thinking));
}

#[tokio::test]
async fn context_injection_reaches_agent() {
    use std::sync::Mutex;

    struct RecordingAgent {
        contexts: Arc<Mutex<Vec<String>>>,
        go: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl WorkerAgent for RecordingAgent {
        async fn run_task(
            &self,
            _task: &str,
            _hooks: AgentHooks,
        ) -> Result<AgentOutcome, AgentError> {
            // Wait until the injected context has arrived.
            self.go.notified().await;
            Ok(AgentOutcome::default())
        }

        fn inject_context(&self, context: &str) {
            self.contexts.lock().unwrap().push(context.to_string());
            self.go.notify_one();
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("orc.sock");
    let (server, mut events) = started_server(&socket, ServerConfig::default()).await;
    let server = Arc::new(server);

    let injector = Arc::clone(&server);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::WorkerConnected { worker_id, .. } = event {
                injector
                    .send(
                        &worker_id,
                        &platoon::ipc::CommanderMessage::inject_context(
                            "the API moved to v2",
                            None,
                        ),
                    )
                    .await;
            }
        }
    });

    let contexts = Arc::new(Mutex::new(Vec::new()));
    let agent = Arc::new(RecordingAgent {
        contexts: Arc::clone(&contexts),
        go: Arc::new(tokio::sync::Notify::new()),
    });

    let config = WorkerConfig::new("w5", "feat/ctx", "task");
    let supervisor = ChildSupervisor::new(&socket, config, dir.path());
    let result = timeout(WAIT, supervisor.run(agent))
        .await
        .expect("supervisor run timed out");
    assert!(result.success);

    let seen = contexts.lock().unwrap();
    assert_eq!(seen.as_slice(), ["the API moved to v2"]);
}
