// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the orchestration server.

use thiserror::Error;

/// Errors that can occur on the commander side of the IPC channel.
#[derive(Debug, Error)]
pub enum IpcError {
    /// IO error during socket operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is not running.
    #[error("server not running")]
    NotRunning,

    /// Server is already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Result alias for server-side IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
