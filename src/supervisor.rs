// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child supervisor for worker processes.
//!
//! The supervisor runs in a worker process and wires the external agent
//! loop to the commander: agent output becomes log and status traffic, and
//! the agent's approval hook becomes a permission round trip over IPC.
//!
//! # Lifecycle
//!
//! 1. Connect to commander's socket and handshake
//! 2. Report `starting` then `thinking`
//! 3. Drive the agent with instrumented hooks
//! 4. Report `task_complete` or `task_error`
//! 5. Disconnect and return the result
//!
//! Failures are logged locally before any attempt to report them over IPC,
//! so a broken channel never swallows the cause of a failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::agent::{AgentHooks, ConfirmationResult, WorkerAgent};
use crate::ipc::{
    ClientEvent, LogLevel, OrchestrationClient, PermissionDecision, SessionConfig, StatusKind,
    TaskFailure,
};
use crate::types::{WorkerConfig, WorkerResult};
use crate::worktree::{changed_files_since, commits_since};

/// Drives one agent task under commander supervision.
pub struct ChildSupervisor {
    client: Arc<OrchestrationClient>,
    config: WorkerConfig,
    /// Worktree the agent works in; used for commit/diff stats.
    worktree_dir: PathBuf,
    base_branch: String,
}

impl ChildSupervisor {
    /// Create a supervisor for one worker.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        config: WorkerConfig,
        worktree_dir: impl Into<PathBuf>,
    ) -> Self {
        let socket_path = socket_path.into();
        let client = Arc::new(OrchestrationClient::new(&socket_path, &config.id));
        Self {
            client,
            config,
            worktree_dir: worktree_dir.into(),
            base_branch: "main".to_string(),
        }
    }

    /// Set the base branch used for commit/diff stats.
    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Arc<OrchestrationClient> {
        &self.client
    }

    /// Run the task to completion.
    ///
    /// Never returns an error: connection and execution failures are folded
    /// into a failure [`WorkerResult`] so the worker process can always map
    /// the outcome to an exit code.
    pub async fn run(&self, agent: Arc<dyn WorkerAgent>) -> WorkerResult {
        let start = Instant::now();

        let hello = self.config.hello(&self.worktree_dir);
        let session = match self.client.connect(&hello).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to connect to commander: {}", e);
                return WorkerResult::failure(
                    &self.config.id,
                    &self.config.branch,
                    format!("connection failed: {e}"),
                );
            }
        };
        info!(
            "Worker {} connected, auto-approve: {:?}",
            self.config.id, session.auto_approve
        );

        // Pump inbound directives while the agent runs.
        let pump = self.spawn_event_pump(Arc::clone(&agent));

        let _ = self.client.send_status(StatusKind::Starting, None).await;
        let _ = self.client.send_status(StatusKind::Thinking, None).await;

        let tool_calls = Arc::new(AtomicU32::new(0));
        let hooks = self.build_hooks(&session, Arc::clone(&tool_calls));

        let outcome = agent.run_task(&self.config.task, hooks).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(outcome) => {
                let commits = commits_since(&self.worktree_dir, &self.base_branch).await;
                let files_changed =
                    changed_files_since(&self.worktree_dir, &self.base_branch).await;

                let mut result =
                    WorkerResult::success(&self.config.id, &self.config.branch, outcome.response);
                result.tool_call_count = tool_calls.load(Ordering::Relaxed);
                result.tokens_used = outcome.tokens_used;
                result.duration_ms = duration_ms;
                result.commits = commits;
                result.files_changed = files_changed;

                if let Err(e) = self.client.send_task_complete(result.clone()).await {
                    warn!("Failed to report completion: {}", e);
                }
                let _ = self.client.send_status(StatusKind::Complete, None).await;
                result
            }
            Err(e) => {
                // Local record first; the channel may be the thing that broke.
                error!("Worker {} task failed: {}", self.config.id, e);

                let mut result =
                    WorkerResult::failure(&self.config.id, &self.config.branch, e.to_string());
                result.tool_call_count = tool_calls.load(Ordering::Relaxed);
                result.duration_ms = duration_ms;

                if self.client.is_connected() {
                    let failure = TaskFailure {
                        message: e.to_string(),
                        code: None,
                        recoverable: e.is_recoverable(),
                    };
                    if let Err(send_err) = self.client.send_task_error(failure).await {
                        warn!("Failed to report error: {}", send_err);
                    }
                    let status = if self.client.is_cancelled() {
                        StatusKind::Cancelled
                    } else {
                        StatusKind::Failed
                    };
                    let _ = self.client.send_status(status, None).await;
                }
                result
            }
        };

        pump.abort();
        self.client.disconnect().await;
        result
    }

    fn spawn_event_pump(&self, agent: Arc<dyn WorkerAgent>) -> tokio::task::JoinHandle<()> {
        let mut events = match self.client.take_events() {
            Some(rx) => rx,
            None => return tokio::spawn(async {}),
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::ContextInjected { context, .. } => {
                        agent.inject_context(&context);
                    }
                    ClientEvent::Cancelled { reason } => {
                        warn!("Cancelled by commander: {:?}", reason);
                    }
                }
            }
        })
    }

    /// Instrument the agent: text and tool failures become log traffic, tool
    /// starts become status updates, and approval goes over the wire.
    fn build_hooks(&self, session: &SessionConfig, tool_calls: Arc<AtomicU32>) -> AgentHooks {
        let timeout = session
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.permission_timeout());
        let auto_approve = session.auto_approve.clone();

        let mut hooks = AgentHooks::default();

        let client = Arc::clone(&self.client);
        hooks.on_text = Some(Arc::new(move |text: &str| {
            let client = Arc::clone(&client);
            let text = text.to_string();
            tokio::spawn(async move {
                let _ = client.send_log(LogLevel::Text, text).await;
            });
        }));

        let client = Arc::clone(&self.client);
        hooks.on_tool_call = Some(Arc::new(move |tool_name: &str, _input| {
            tool_calls.fetch_add(1, Ordering::Relaxed);
            let client = Arc::clone(&client);
            let tool = tool_name.to_string();
            tokio::spawn(async move {
                let _ = client
                    .send_status(StatusKind::ToolCall { tool }, None)
                    .await;
            });
        }));

        let client = Arc::clone(&self.client);
        hooks.on_tool_result = Some(Arc::new(
            move |tool_name: &str, output: &str, is_error: bool| {
                if !is_error {
                    return;
                }
                let client = Arc::clone(&client);
                let content = format!("{tool_name}: {output}");
                tokio::spawn(async move {
                    let _ = client.send_log(LogLevel::Error, content).await;
                });
            },
        ));

        let client = Arc::clone(&self.client);
        hooks.on_confirm = Some(Arc::new(move |confirmation| {
            let client = Arc::clone(&client);
            let auto_approve = auto_approve.clone();
            Box::pin(async move {
                if client.is_cancelled() {
                    return ConfirmationResult::Abort;
                }
                if !confirmation.is_dangerous && auto_approve.contains(&confirmation.tool_name) {
                    return ConfirmationResult::Approve;
                }

                let _ = client
                    .send_status(
                        StatusKind::WaitingPermission {
                            tool: confirmation.tool_name.clone(),
                        },
                        None,
                    )
                    .await;

                match client
                    .request_permission_with_timeout(&confirmation, timeout)
                    .await
                {
                    Ok(PermissionDecision::Approve) => {
                        let _ = client.send_status(StatusKind::Thinking, None).await;
                        ConfirmationResult::Approve
                    }
                    Ok(PermissionDecision::Deny { reason }) => {
                        warn!("Permission denied: {:?}", reason);
                        ConfirmationResult::Deny
                    }
                    Ok(PermissionDecision::Abort) => {
                        warn!("Task aborted by commander");
                        ConfirmationResult::Abort
                    }
                    Err(e) => {
                        // Fail closed: a broken round trip never approves.
                        warn!("Permission request failed ({}); denying", e);
                        ConfirmationResult::Deny
                    }
                }
            })
        }));

        hooks
    }
}
