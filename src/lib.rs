// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Platoon - parallel coding-agent orchestration.
//!
//! A commander process delegates tasks to worker agent processes. Each worker
//! operates in an isolated git worktree on its own branch and talks to the
//! commander over a local Unix socket: status flows up, approval decisions
//! flow down.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Shared data model (WorkerConfig, WorkerResult, CancelToken)
//! - [`agent`] - Seam to the external single-agent loop (WorkerAgent, AgentHooks)
//! - [`ipc`] - Wire protocol, orchestration server, and orchestration client
//! - [`worktree`] - Git worktree lifecycle and conflict classification
//! - [`supervisor`] - Worker-side wiring of agent hooks to IPC
//!
//! # Example
//!
//! ```rust,ignore
//! use platoon::ipc::{OrchestrationServer, ServerEvent};
//! use platoon::types::socket_path_for_project;
//!
//! let mut server = OrchestrationServer::new(socket_path_for_project(project_root));
//! server.start().await?;
//! let mut events = server.take_events().unwrap();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ServerEvent::PermissionRequested { worker_id, request_id, .. } => { /* decide */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod agent;
pub mod ipc;
pub mod supervisor;
pub mod types;
pub mod worktree;

// Re-export commonly used types at crate root
pub use agent::{AgentError, AgentHooks, AgentOutcome, ConfirmationResult, ToolConfirmation, WorkerAgent};
pub use ipc::{
    ClientEvent, CommanderMessage, IpcClientError, IpcError, LogLevel, OrchestrationClient,
    OrchestrationServer, PermissionDecision, ServerConfig, ServerEvent, SessionConfig, StatusKind,
    TaskFailure, WorkerMessage,
};
pub use supervisor::ChildSupervisor;
pub use types::{socket_path_for_project, CancelToken, TokenUsage, WorkerConfig, WorkerHello, WorkerResult};
pub use worktree::{RemoveOptions, WorktreeError, WorktreeInfo, WorktreeManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
