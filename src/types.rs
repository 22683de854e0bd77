// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared data model for commander/worker orchestration.
//!
//! These types cross the process boundary (serde) or are shared between the
//! client, supervisor, and worktree manager within one process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ============================================================================
// Token Usage
// ============================================================================

/// Token counts reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt.
    pub input_tokens: u32,
    /// Number of tokens in the output/completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Get total tokens (input + output).
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

fn default_permission_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

/// Configuration for a worker agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker.
    pub id: String,
    /// Branch name for this worker's isolated workspace.
    pub branch: String,
    /// Task description for the worker to execute.
    pub task: String,
    /// Optional model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional provider override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Permission round-trip timeout in milliseconds.
    #[serde(default = "default_permission_timeout_ms")]
    pub permission_timeout_ms: u64,
}

impl WorkerConfig {
    /// Create a new worker config with minimal required fields.
    pub fn new(id: impl Into<String>, branch: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            branch: branch.into(),
            task: task.into(),
            model: None,
            provider: None,
            permission_timeout_ms: default_permission_timeout_ms(),
        }
    }

    /// Set the model for this worker.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the provider for this worker.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set the permission round-trip timeout.
    pub fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Permission timeout as a [`Duration`].
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms)
    }

    /// Build the handshake payload for this worker in the given worktree.
    pub fn hello(&self, worktree: impl Into<PathBuf>) -> WorkerHello {
        WorkerHello {
            worker_id: self.id.clone(),
            worktree: worktree.into(),
            branch: self.branch.clone(),
            task: self.task.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
        }
    }
}

/// Identity payload a worker presents during the handshake.
#[derive(Debug, Clone)]
pub struct WorkerHello {
    /// Worker ID.
    pub worker_id: String,
    /// Path to the worker's isolated worktree.
    pub worktree: PathBuf,
    /// Branch the worker operates on.
    pub branch: String,
    /// Task description.
    pub task: String,
    /// Model being used, if declared.
    pub model: Option<String>,
    /// Provider being used, if declared.
    pub provider: Option<String>,
}

// ============================================================================
// Worker Result
// ============================================================================

/// Result from a completed worker, produced once at task end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Worker that produced this result.
    pub worker_id: String,
    /// Whether the task completed successfully.
    pub success: bool,
    /// Final response text from the agent.
    pub response: String,
    /// Number of tool calls made.
    pub tool_call_count: u32,
    /// Token usage for the task.
    #[serde(default)]
    pub tokens_used: TokenUsage,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Pull request URL, if one was opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// Branch where the work was done.
    pub branch: String,
    /// Commits created on the branch.
    #[serde(default)]
    pub commits: Vec<String>,
    /// Files changed on the branch.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Error message for failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResult {
    /// Create a successful result.
    pub fn success(
        worker_id: impl Into<String>,
        branch: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            success: true,
            response: response.into(),
            tool_call_count: 0,
            tokens_used: TokenUsage::default(),
            duration_ms: 0,
            pr_url: None,
            branch: branch.into(),
            commits: Vec::new(),
            files_changed: Vec::new(),
            error: None,
        }
    }

    /// Create a failure result.
    pub fn failure(
        worker_id: impl Into<String>,
        branch: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            success: false,
            response: String::new(),
            tool_call_count: 0,
            tokens_used: TokenUsage::default(),
            duration_ms: 0,
            pr_url: None,
            branch: branch.into(),
            commits: Vec::new(),
            files_changed: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Map this result to a process exit code.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token.
///
/// Cancellation is sticky and never preemptive: long-running operations check
/// the token at their own decision points. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Flip the token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Check the token without suspending.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Socket Path
// ============================================================================

/// Get the orchestration socket path for a project.
///
/// Returns `<project_root>/.platoon/orchestrator.sock`; one path per
/// orchestration session.
pub fn socket_path_for_project(project_root: &Path) -> PathBuf {
    project_root.join(".platoon").join("orchestrator.sock")
}
