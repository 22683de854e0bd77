// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Seam to the external single-agent loop.
//!
//! The supervisor does not own a model loop; it drives one through
//! [`WorkerAgent`] and observes it through [`AgentHooks`]. The only hook the
//! supervisor substitutes with its own behavior is `on_confirm`, which routes
//! approval decisions to the commander instead of a local prompt.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenUsage;

/// A tool operation awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfirmation {
    /// Name of the tool.
    pub tool_name: String,
    /// Tool input arguments.
    pub input: serde_json::Value,
    /// Whether this is a dangerous operation.
    pub is_dangerous: bool,
    /// Reason why it's considered dangerous.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danger_reason: Option<String>,
}

impl ToolConfirmation {
    /// Create a confirmation for a non-dangerous tool call.
    pub fn new(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            is_dangerous: false,
            danger_reason: None,
        }
    }

    /// Mark this confirmation as dangerous.
    pub fn dangerous(mut self, reason: impl Into<String>) -> Self {
        self.is_dangerous = true;
        self.danger_reason = Some(reason.into());
        self
    }
}

/// Result of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// The operation may proceed.
    Approve,
    /// This specific operation is denied.
    Deny,
    /// Abort the entire task.
    Abort,
}

/// Future returned by the confirmation hook.
pub type ConfirmFuture = Pin<Box<dyn Future<Output = ConfirmationResult> + Send>>;

/// Callbacks wired into the agent loop.
///
/// Uses `Arc` instead of `Box` so hooks can be cloned into background tasks
/// without lifetime issues. `on_confirm` returns a future because the approval
/// round trip suspends its caller.
#[derive(Clone, Default)]
pub struct AgentHooks {
    /// Called when the model outputs text.
    pub on_text: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Called when a tool is about to be executed (tool_name, input).
    pub on_tool_call: Option<Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>>,
    /// Called when a tool execution completes (tool_name, output, is_error).
    pub on_tool_result: Option<Arc<dyn Fn(&str, &str, bool) + Send + Sync>>,
    /// Called to confirm risky operations.
    pub on_confirm: Option<Arc<dyn Fn(ToolConfirmation) -> ConfirmFuture + Send + Sync>>,
}

impl std::fmt::Debug for AgentHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHooks")
            .field("on_text", &self.on_text.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_tool_result", &self.on_tool_result.is_some())
            .field("on_confirm", &self.on_confirm.is_some())
            .finish()
    }
}

/// What the agent produced for one task.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// Final response text.
    pub response: String,
    /// Token usage for the task.
    pub tokens_used: TokenUsage,
}

/// Error type for agent task execution.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The task failed and retrying in the same workspace will not help.
    #[error("agent task failed: {0}")]
    TaskFailed(String),

    /// The task was interrupted (aborted confirmation, cancellation);
    /// a restart may succeed.
    #[error("agent task interrupted: {0}")]
    Interrupted(String),
}

impl AgentError {
    /// Whether a restarted worker could plausibly recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

/// The external single-agent loop, as seen by the supervisor.
///
/// Implementations are expected to be internally synchronized: `run_task`
/// drives the loop while `inject_context` may be called concurrently from the
/// supervisor's event pump.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Execute one task to completion, reporting through `hooks`.
    async fn run_task(&self, task: &str, hooks: AgentHooks) -> Result<AgentOutcome, AgentError>;

    /// Add commander-provided context to the conversation.
    fn inject_context(&self, context: &str);
}
