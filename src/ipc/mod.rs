// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC (Inter-Process Communication) module for commander-worker communication.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐              ┌─────────────────┐
//! │    Commander    │              │     Worker      │
//! │                 │              │                 │
//! │  ┌───────────┐  │    Unix      │  ┌───────────┐  │
//! │  │  Server   │◄─┼──socket──────┼──│  Client   │  │
//! │  └───────────┘  │              │  └───────────┘  │
//! └─────────────────┘              └─────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages are newline-delimited JSON (NDJSON). Each message is a complete
//! JSON object followed by a newline character. Transport is a Unix domain
//! socket whose path the commander publishes per project.
//!
//! ## Worker → Commander Messages
//!
//! - `handshake` - Initial connection from worker
//! - `permission_request` - Request approval for a tool operation
//! - `status_update` - Progress update
//! - `task_complete` - Successful completion
//! - `task_error` - Task failed
//! - `log` - Log output
//! - `pong` - Response to ping
//!
//! ## Commander → Worker Messages
//!
//! - `handshake_ack` - Accept/reject worker connection
//! - `permission_response` - Approve/deny/abort tool operation
//! - `inject_context` - Add context to worker's conversation
//! - `cancel` - Cancel the worker
//! - `ping` - Liveness probe

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use error::{IpcError, IpcResult};

pub use client::{ClientEvent, IpcClientError, OrchestrationClient};
pub use protocol::{
    decode, encode, CommanderMessage, LogLevel, PermissionDecision, RecordBuffer, SessionConfig,
    StatusKind, TaskFailure, WorkerMessage,
};
pub use server::{OrchestrationServer, ServerConfig, ServerEvent};
