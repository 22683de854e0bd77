// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol for commander-worker communication.
//!
//! Newline-delimited JSON: one record per line, UTF-8, no length prefix.
//! The vocabulary is closed — two tagged enums, one per direction — and
//! dispatch uses explicit per-type predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::ToolConfirmation;
use crate::types::{TokenUsage, WorkerHello, WorkerResult};

// ============================================================================
// Message Envelope
// ============================================================================

/// Generate a unique message ID.
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// Worker -> Commander Messages
// ============================================================================

/// Messages sent from worker to commander.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Initial handshake establishing worker identity.
    Handshake {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// Path to the worker's worktree.
        worktree: String,
        /// Branch name.
        branch: String,
        /// Task description.
        task: String,
        /// Model being used.
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Provider being used.
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },

    /// Request approval for a tool operation. The envelope `id` is the
    /// correlator echoed back in `permission_response.request_id`.
    PermissionRequest {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// The operation awaiting approval.
        confirmation: ToolConfirmation,
    },

    /// Status update from worker.
    StatusUpdate {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// Current status.
        status: StatusKind,
        /// Current tool being executed.
        #[serde(skip_serializing_if = "Option::is_none")]
        current_tool: Option<String>,
        /// Progress percentage (0-100).
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        /// Token usage so far.
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_used: Option<TokenUsage>,
        /// Optional status message.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Task completed successfully.
    TaskComplete {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// Completion result.
        result: WorkerResult,
    },

    /// Task failed with error.
    TaskError {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// Failure details.
        error: TaskFailure,
    },

    /// Log output from worker.
    Log {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Worker ID.
        worker_id: String,
        /// Log level.
        level: LogLevel,
        /// Log content.
        content: String,
    },

    /// Pong response to ping.
    Pong {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },
}

/// Worker status carried in `status_update` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Starting,
    Thinking,
    ToolCall { tool: String },
    WaitingPermission { tool: String },
    Complete,
    Failed,
    Cancelled,
}

impl StatusKind {
    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// The tool name this status refers to, if any.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool } | Self::WaitingPermission { tool } => Some(tool),
            _ => None,
        }
    }
}

/// Failure details carried in `task_error` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error message.
    pub message: String,
    /// Error code (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Whether a restarted worker could plausibly recover.
    pub recoverable: bool,
}

/// Log levels for worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Regular text output.
    Text,
    /// Tool execution output.
    Tool,
    /// Informational message.
    Info,
    /// Warning message.
    Warn,
    /// Error message.
    Error,
}

impl WorkerMessage {
    /// Create a handshake message.
    pub fn handshake(hello: &WorkerHello) -> Self {
        Self::Handshake {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: hello.worker_id.clone(),
            worktree: hello.worktree.to_string_lossy().to_string(),
            branch: hello.branch.clone(),
            task: hello.task.clone(),
            model: hello.model.clone(),
            provider: hello.provider.clone(),
        }
    }

    /// Create a permission request message.
    pub fn permission_request(worker_id: impl Into<String>, confirmation: &ToolConfirmation) -> Self {
        Self::PermissionRequest {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: worker_id.into(),
            confirmation: confirmation.clone(),
        }
    }

    /// Create a status update message. `current_tool` is derived from the
    /// status kind.
    pub fn status_update(
        worker_id: impl Into<String>,
        status: StatusKind,
        tokens_used: Option<TokenUsage>,
    ) -> Self {
        let current_tool = status.tool().map(|t| t.to_string());
        Self::StatusUpdate {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: worker_id.into(),
            status,
            current_tool,
            progress: None,
            tokens_used,
            message: None,
        }
    }

    /// Create a task complete message.
    pub fn task_complete(result: WorkerResult) -> Self {
        Self::TaskComplete {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: result.worker_id.clone(),
            result,
        }
    }

    /// Create a task error message.
    pub fn task_error(worker_id: impl Into<String>, error: TaskFailure) -> Self {
        Self::TaskError {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: worker_id.into(),
            error,
        }
    }

    /// Create a log message.
    pub fn log(worker_id: impl Into<String>, level: LogLevel, content: impl Into<String>) -> Self {
        Self::Log {
            id: generate_message_id(),
            timestamp: now(),
            worker_id: worker_id.into(),
            level,
            content: content.into(),
        }
    }

    /// Create a pong response.
    pub fn pong() -> Self {
        Self::Pong {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    /// Get the envelope message ID.
    pub fn id(&self) -> &str {
        match self {
            Self::Handshake { id, .. }
            | Self::PermissionRequest { id, .. }
            | Self::StatusUpdate { id, .. }
            | Self::TaskComplete { id, .. }
            | Self::TaskError { id, .. }
            | Self::Log { id, .. }
            | Self::Pong { id, .. } => id,
        }
    }

    /// Get the envelope timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Handshake { timestamp, .. }
            | Self::PermissionRequest { timestamp, .. }
            | Self::StatusUpdate { timestamp, .. }
            | Self::TaskComplete { timestamp, .. }
            | Self::TaskError { timestamp, .. }
            | Self::Log { timestamp, .. }
            | Self::Pong { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this is a handshake message.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake { .. })
    }

    /// Check if this is a permission request.
    pub fn is_permission_request(&self) -> bool {
        matches!(self, Self::PermissionRequest { .. })
    }

    /// Check if this is a status update.
    pub fn is_status_update(&self) -> bool {
        matches!(self, Self::StatusUpdate { .. })
    }

    /// Check if this is a pong.
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Pong { .. })
    }

    /// Check if this is a terminal message (complete or error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskComplete { .. } | Self::TaskError { .. })
    }
}

// ============================================================================
// Commander -> Worker Messages
// ============================================================================

/// Per-session settings handed to a worker in the handshake ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Tools approved without a permission round trip.
    #[serde(default)]
    pub auto_approve: Vec<String>,
    /// Permission round-trip timeout override, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Messages sent from commander to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommanderMessage {
    /// Accept or reject a handshake.
    HandshakeAck {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Whether the handshake was accepted.
        accepted: bool,
        /// Rejection reason (if not accepted).
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Session settings for the worker.
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<SessionConfig>,
        /// Initial context for the worker's conversation.
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },

    /// Response to a permission request.
    PermissionResponse {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// The `permission_request` id being answered.
        request_id: String,
        /// The decision.
        result: PermissionDecision,
    },

    /// Cancel the worker. Cooperative; enforced at the worker's next
    /// decision point.
    Cancel {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Reason for cancellation.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Inject context into the worker's conversation.
    InjectContext {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
        /// Context to inject.
        context: String,
        /// Relevant files (if any).
        #[serde(skip_serializing_if = "Option::is_none")]
        relevant_files: Option<Vec<String>>,
    },

    /// Liveness probe; the worker answers with `pong`.
    Ping {
        /// Message ID.
        id: String,
        /// Timestamp.
        timestamp: DateTime<Utc>,
    },
}

/// Decision carried in a `permission_response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PermissionDecision {
    /// Permission granted.
    Approve,
    /// Permission denied.
    Deny {
        /// Reason for denial.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Abort the entire task.
    Abort,
}

impl CommanderMessage {
    /// Create an accepting handshake ack.
    pub fn handshake_accept(config: SessionConfig, context: Option<String>) -> Self {
        Self::HandshakeAck {
            id: generate_message_id(),
            timestamp: now(),
            accepted: true,
            error: None,
            config: Some(config),
            context,
        }
    }

    /// Create a rejecting handshake ack.
    pub fn handshake_reject(error: impl Into<String>) -> Self {
        Self::HandshakeAck {
            id: generate_message_id(),
            timestamp: now(),
            accepted: false,
            error: Some(error.into()),
            config: None,
            context: None,
        }
    }

    /// Create a permission approval.
    pub fn approve(request_id: impl Into<String>) -> Self {
        Self::PermissionResponse {
            id: generate_message_id(),
            timestamp: now(),
            request_id: request_id.into(),
            result: PermissionDecision::Approve,
        }
    }

    /// Create a permission denial.
    pub fn deny(request_id: impl Into<String>, reason: Option<String>) -> Self {
        Self::PermissionResponse {
            id: generate_message_id(),
            timestamp: now(),
            request_id: request_id.into(),
            result: PermissionDecision::Deny { reason },
        }
    }

    /// Create a permission abort.
    pub fn abort(request_id: impl Into<String>) -> Self {
        Self::PermissionResponse {
            id: generate_message_id(),
            timestamp: now(),
            request_id: request_id.into(),
            result: PermissionDecision::Abort,
        }
    }

    /// Create a cancel message.
    pub fn cancel(reason: Option<String>) -> Self {
        Self::Cancel {
            id: generate_message_id(),
            timestamp: now(),
            reason,
        }
    }

    /// Create a context injection message.
    pub fn inject_context(context: impl Into<String>, relevant_files: Option<Vec<String>>) -> Self {
        Self::InjectContext {
            id: generate_message_id(),
            timestamp: now(),
            context: context.into(),
            relevant_files,
        }
    }

    /// Create a ping message.
    pub fn ping() -> Self {
        Self::Ping {
            id: generate_message_id(),
            timestamp: now(),
        }
    }

    /// Get the envelope message ID.
    pub fn id(&self) -> &str {
        match self {
            Self::HandshakeAck { id, .. }
            | Self::PermissionResponse { id, .. }
            | Self::Cancel { id, .. }
            | Self::InjectContext { id, .. }
            | Self::Ping { id, .. } => id,
        }
    }

    /// Check if this is a handshake ack.
    pub fn is_handshake_ack(&self) -> bool {
        matches!(self, Self::HandshakeAck { .. })
    }

    /// Check if this is a permission response.
    pub fn is_permission_response(&self) -> bool {
        matches!(self, Self::PermissionResponse { .. })
    }

    /// Check if this is a cancel message.
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel { .. })
    }

    /// Check if this is a ping message.
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping { .. })
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Encode a message to a newline-terminated JSON record.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from one record. Fails per line; a corrupt record never
/// affects its neighbors.
pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Accumulates raw bytes from a stream and yields complete
/// newline-terminated records, keeping any trailing partial record buffered.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: Vec<u8>,
}

impl RecordBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain every complete record, in arrival order. Empty lines are
    /// dropped; invalid UTF-8 is replaced rather than aborting the stream.
    pub fn drain_records(&mut self) -> Vec<String> {
        let mut records = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let record: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&record[..pos]).trim().to_string();
            if !line.is_empty() {
                records.push(line);
            }
        }
        records
    }

    /// Bytes buffered for a not-yet-complete record.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hello() -> WorkerHello {
        WorkerHello {
            worker_id: "w1".to_string(),
            worktree: PathBuf::from("/tmp/platoon-w1"),
            branch: "w1".to_string(),
            task: "Do something".to_string(),
            model: None,
            provider: None,
        }
    }

    #[test]
    fn test_handshake_roundtrip() {
        let msg = WorkerMessage::handshake(&hello());
        assert!(msg.is_handshake());

        let json = encode(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"worker_id\":\"w1\""));
        assert!(json.ends_with('\n'));
        assert_eq!(json.matches('\n').count(), 1);

        let decoded: WorkerMessage = decode(&json).unwrap();
        assert!(decoded.is_handshake());
        assert_eq!(decoded.id(), msg.id());
        assert_eq!(decoded.timestamp(), msg.timestamp());
    }

    #[test]
    fn test_permission_request_correlator() {
        let confirmation = ToolConfirmation::new("bash", serde_json::json!({"command": "ls"}));
        let msg = WorkerMessage::permission_request("w1", &confirmation);
        assert!(msg.is_permission_request());

        // The envelope id is the correlator the response must echo.
        let response = CommanderMessage::approve(msg.id());
        if let CommanderMessage::PermissionResponse { request_id, result, .. } = &response {
            assert_eq!(request_id, msg.id());
            assert_eq!(*result, PermissionDecision::Approve);
        } else {
            panic!("expected permission response");
        }
    }

    #[test]
    fn test_permission_decision_serialization() {
        let json = serde_json::to_string(&PermissionDecision::Approve).unwrap();
        assert!(json.contains("\"result\":\"approve\""));

        let deny = PermissionDecision::Deny {
            reason: Some("not safe".to_string()),
        };
        let json = serde_json::to_string(&deny).unwrap();
        assert!(json.contains("\"result\":\"deny\""));
        assert!(json.contains("\"reason\":\"not safe\""));

        let bare: PermissionDecision = serde_json::from_str(r#"{"result":"deny"}"#).unwrap();
        assert_eq!(bare, PermissionDecision::Deny { reason: None });
    }

    #[test]
    fn test_status_update_derives_current_tool() {
        let msg = WorkerMessage::status_update(
            "w1",
            StatusKind::ToolCall {
                tool: "bash".to_string(),
            },
            None,
        );
        if let WorkerMessage::StatusUpdate { current_tool, status, .. } = &msg {
            assert_eq!(current_tool.as_deref(), Some("bash"));
            assert!(!status.is_terminal());
        } else {
            panic!("expected status update");
        }
    }

    #[test]
    fn test_terminal_messages() {
        let result = WorkerResult::success("w1", "w1", "Done!");
        assert!(WorkerMessage::task_complete(result).is_terminal());

        let failure = TaskFailure {
            message: "connection refused".to_string(),
            code: None,
            recoverable: true,
        };
        assert!(WorkerMessage::task_error("w1", failure).is_terminal());
        assert!(!WorkerMessage::pong().is_terminal());
    }

    #[test]
    fn test_handshake_ack_shapes() {
        let accept = CommanderMessage::handshake_accept(
            SessionConfig {
                auto_approve: vec!["read_file".to_string()],
                timeout_ms: Some(60_000),
            },
            Some("project uses tabs".to_string()),
        );
        let json = encode(&accept).unwrap();
        assert!(json.contains("\"accepted\":true"));
        assert!(json.contains("\"auto_approve\":[\"read_file\"]"));

        let reject = CommanderMessage::handshake_reject("session full");
        let json = encode(&reject).unwrap();
        assert!(json.contains("\"accepted\":false"));
        assert!(json.contains("\"error\":\"session full\""));
        assert!(!json.contains("\"config\""));
    }

    #[test]
    fn test_commander_predicates() {
        assert!(CommanderMessage::ping().is_ping());
        assert!(CommanderMessage::cancel(Some("user requested".to_string())).is_cancel());
        assert!(CommanderMessage::approve("req-1").is_permission_response());
        assert!(CommanderMessage::handshake_reject("no").is_handshake_ack());
    }

    #[test]
    fn test_log_levels() {
        let msg = WorkerMessage::log("w1", LogLevel::Error, "something went wrong");
        let json = encode(&msg).unwrap();
        assert!(json.contains("\"level\":\"error\""));
        assert!(json.contains("\"content\":\"something went wrong\""));
    }

    #[test]
    fn test_record_buffer_fragmented_delivery() {
        let a = encode(&CommanderMessage::ping()).unwrap();
        let b = encode(&CommanderMessage::cancel(None)).unwrap();
        let c = encode(&CommanderMessage::ping()).unwrap();
        let stream = format!("{a}{b}{c}");
        let bytes = stream.as_bytes();

        // Deliver in awkward fragments, including mid-record splits.
        let mut buffer = RecordBuffer::new();
        let mut records = Vec::new();
        for chunk in bytes.chunks(7) {
            buffer.push(chunk);
            records.extend(buffer.drain_records());
        }

        assert_eq!(records.len(), 3);
        assert_eq!(buffer.pending_len(), 0);
        let first: CommanderMessage = decode(&records[0]).unwrap();
        let second: CommanderMessage = decode(&records[1]).unwrap();
        let third: CommanderMessage = decode(&records[2]).unwrap();
        assert!(first.is_ping());
        assert!(second.is_cancel());
        assert!(third.is_ping());
    }

    #[test]
    fn test_record_buffer_keeps_partial() {
        let mut buffer = RecordBuffer::new();
        buffer.push(b"{\"type\":\"ping\",");
        assert!(buffer.drain_records().is_empty());
        assert!(buffer.pending_len() > 0);

        buffer.push(b"\"id\":\"1\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n");
        let records = buffer.drain_records();
        assert_eq!(records.len(), 1);
        let msg: CommanderMessage = decode(&records[0]).unwrap();
        assert!(msg.is_ping());
    }

    #[test]
    fn test_corrupt_record_is_isolated() {
        let mut buffer = RecordBuffer::new();
        buffer.push(b"this is not json\n");
        buffer.push(encode(&CommanderMessage::ping()).unwrap().as_bytes());

        let records = buffer.drain_records();
        assert_eq!(records.len(), 2);
        assert!(decode::<CommanderMessage>(&records[0]).is_err());
        assert!(decode::<CommanderMessage>(&records[1]).unwrap().is_ping());
    }

    #[test]
    fn test_unique_ids() {
        let a = WorkerMessage::pong();
        let b = WorkerMessage::pong();
        assert_ne!(a.id(), b.id());
    }
}
