// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestration client for worker processes.
//!
//! The client connects to the commander's socket, performs the handshake as
//! part of [`OrchestrationClient::connect`], and handles the bidirectional
//! traffic: permission round trips outward, pings and cancellation inward.
//!
//! Every timeout resolves to a safe default. A permission request that gets
//! no answer is a denial; a handshake that gets no ack is a failed connect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{
    decode, encode, CommanderMessage, LogLevel, PermissionDecision, SessionConfig, StatusKind,
    TaskFailure, WorkerMessage,
};
use crate::agent::ToolConfirmation;
use crate::types::{CancelToken, TokenUsage, WorkerHello, WorkerResult};

const CONNECT_RETRY_ATTEMPTS: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("permission request timed out")]
    PermissionTimeout,
}

/// Inbound commander directives the worker loop may care about.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The commander cancelled this worker.
    Cancelled { reason: Option<String> },
    /// The commander injected context into the conversation.
    ContextInjected {
        context: String,
        relevant_files: Vec<String>,
    },
}

/// Orchestration client for worker-commander communication.
///
/// All methods take `&self`; the client is designed to be shared behind an
/// `Arc` between the supervisor and the agent hooks it installs.
pub struct OrchestrationClient {
    socket_path: PathBuf,
    worker_id: String,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    /// Outstanding permission requests by request id.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>>,
    /// Resolves the in-flight handshake, if any.
    handshake_slot: Arc<Mutex<Option<oneshot::Sender<Result<SessionConfig, String>>>>>,
    cancel: CancelToken,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OrchestrationClient {
    /// Create a new client.
    pub fn new(socket_path: impl AsRef<Path>, worker_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            worker_id: worker_id.into(),
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handshake_slot: Arc::new(Mutex::new(None)),
            cancel: CancelToken::new(),
            connected: Arc::new(AtomicBool::new(false)),
            event_tx: tx,
            event_rx: std::sync::Mutex::new(Some(rx)),
            reader_task: std::sync::Mutex::new(None),
        }
    }

    /// Get the worker ID.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Check whether the transport is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Check whether the commander cancelled this worker.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get a clone of the cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Take the inbound event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Connect to the commander and complete the handshake.
    ///
    /// Retries the socket connect briefly (the commander may still be
    /// binding), then sends the handshake and waits for the ack. A missing or
    /// rejecting ack fails the whole call and tears the transport back down.
    pub async fn connect(&self, hello: &WorkerHello) -> Result<SessionConfig, IpcClientError> {
        let mut last_error: Option<String> = None;
        let mut stream = None;

        for attempt in 0..CONNECT_RETRY_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
                .await
            {
                Ok(Ok(conn)) => {
                    stream = Some(conn);
                    break;
                }
                Ok(Err(err)) => {
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    last_error = Some("connect timeout".to_string());
                }
            }

            if attempt + 1 < CONNECT_RETRY_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        let stream = stream.ok_or_else(|| {
            IpcClientError::ConnectionFailed(
                last_error.unwrap_or_else(|| "failed to connect".to_string()),
            )
        })?;
        let (read_half, write_half) = stream.into_split();

        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::Release);

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.handshake_slot.lock().await = Some(ack_tx);

        // Spawn the reader before sending the handshake so the ack cannot
        // race past us.
        let handle = tokio::spawn(Self::read_loop(
            read_half,
            Arc::clone(&self.writer),
            Arc::clone(&self.pending),
            Arc::clone(&self.handshake_slot),
            self.cancel.clone(),
            Arc::clone(&self.connected),
            self.event_tx.clone(),
        ));
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }

        let msg = WorkerMessage::handshake(hello);
        if let Err(e) = self.write(&msg).await {
            self.teardown().await;
            return Err(e);
        }

        let ack = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.teardown().await;
                return Err(IpcClientError::ConnectionClosed);
            }
            Err(_) => {
                self.teardown().await;
                return Err(IpcClientError::HandshakeTimeout);
            }
        };

        match ack {
            Ok(config) => {
                debug!("Connected to commander at {:?}", self.socket_path);
                Ok(config)
            }
            Err(reason) => {
                self.teardown().await;
                Err(IpcClientError::HandshakeRejected(reason))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        read_half: tokio::net::unix::OwnedReadHalf,
        writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
        pending: Arc<Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>>,
        handshake_slot: Arc<Mutex<Option<oneshot::Sender<Result<SessionConfig, String>>>>>,
        cancel: CancelToken,
        connected: Arc<AtomicBool>,
        event_tx: mpsc::Sender<ClientEvent>,
    ) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!("Commander disconnected");
                    break;
                }
                Ok(_) => {
                    let msg = match decode::<CommanderMessage>(&line) {
                        Ok(msg) => msg,
                        Err(e) => {
                            error!("Failed to parse commander message: {}", e);
                            continue;
                        }
                    };
                    Self::handle_commander_message(
                        msg,
                        &writer,
                        &pending,
                        &handshake_slot,
                        &cancel,
                        &event_tx,
                    )
                    .await;
                }
                Err(e) => {
                    error!("Error reading from commander: {}", e);
                    break;
                }
            }
        }

        connected.store(false, Ordering::Release);
        *writer.lock().await = None;
        // Dropping the senders resolves every waiter with ConnectionClosed.
        pending.lock().await.clear();
        handshake_slot.lock().await.take();
    }

    async fn handle_commander_message(
        msg: CommanderMessage,
        writer: &Arc<Mutex<Option<OwnedWriteHalf>>>,
        pending: &Arc<Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>>,
        handshake_slot: &Arc<Mutex<Option<oneshot::Sender<Result<SessionConfig, String>>>>>,
        cancel: &CancelToken,
        event_tx: &mpsc::Sender<ClientEvent>,
    ) {
        match msg {
            CommanderMessage::HandshakeAck {
                accepted,
                error,
                config,
                context,
                ..
            } => {
                let result = if accepted {
                    Ok(config.unwrap_or_default())
                } else {
                    Err(error.unwrap_or_else(|| "handshake rejected".to_string()))
                };
                match handshake_slot.lock().await.take() {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("Unsolicited handshake ack dropped"),
                }
                if accepted {
                    if let Some(context) = context {
                        let _ = event_tx
                            .send(ClientEvent::ContextInjected {
                                context,
                                relevant_files: Vec::new(),
                            })
                            .await;
                    }
                }
            }
            CommanderMessage::PermissionResponse {
                request_id, result, ..
            } => match pending.lock().await.remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                // Late answer to a request that already timed out.
                None => debug!("Permission response for unknown request {}", request_id),
            },
            CommanderMessage::Cancel { reason, .. } => {
                warn!("Received cancel: {:?}", reason);
                cancel.cancel();
                for (_, tx) in pending.lock().await.drain() {
                    let _ = tx.send(PermissionDecision::Abort);
                }
                let _ = event_tx.send(ClientEvent::Cancelled { reason }).await;
            }
            CommanderMessage::InjectContext {
                context,
                relevant_files,
                ..
            } => {
                let _ = event_tx
                    .send(ClientEvent::ContextInjected {
                        context,
                        relevant_files: relevant_files.unwrap_or_default(),
                    })
                    .await;
            }
            CommanderMessage::Ping { .. } => {
                let pong = WorkerMessage::pong();
                if let Ok(encoded) = encode(&pong) {
                    let mut writer = writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        if w.write_all(encoded.as_bytes()).await.is_ok() {
                            let _ = w.flush().await;
                        }
                    }
                }
            }
        }
    }

    async fn write(&self, msg: &WorkerMessage) -> Result<(), IpcClientError> {
        let encoded = encode(msg)?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(IpcClientError::NotConnected)?;
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Request permission for a tool operation with the default timeout.
    pub async fn request_permission(
        &self,
        confirmation: &ToolConfirmation,
    ) -> Result<PermissionDecision, IpcClientError> {
        self.request_permission_with_timeout(confirmation, DEFAULT_PERMISSION_TIMEOUT)
            .await
    }

    /// Request permission for a tool operation.
    ///
    /// If already cancelled this short-circuits to `Abort` without touching
    /// the transport. A timeout removes the pending entry so a late answer is
    /// dropped rather than misdelivered.
    pub async fn request_permission_with_timeout(
        &self,
        confirmation: &ToolConfirmation,
        timeout: Duration,
    ) -> Result<PermissionDecision, IpcClientError> {
        if self.cancel.is_cancelled() {
            return Ok(PermissionDecision::Abort);
        }

        let msg = WorkerMessage::permission_request(&self.worker_id, confirmation);
        let request_id = msg.id().to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = self.write(&msg).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Err(IpcClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(IpcClientError::PermissionTimeout)
            }
        }
    }

    /// Send a status update.
    pub async fn send_status(
        &self,
        status: StatusKind,
        tokens: Option<TokenUsage>,
    ) -> Result<(), IpcClientError> {
        let msg = WorkerMessage::status_update(&self.worker_id, status, tokens);
        self.write(&msg).await
    }

    /// Send task completion.
    pub async fn send_task_complete(&self, result: WorkerResult) -> Result<(), IpcClientError> {
        let msg = WorkerMessage::task_complete(result);
        self.write(&msg).await
    }

    /// Send task failure.
    pub async fn send_task_error(&self, error: TaskFailure) -> Result<(), IpcClientError> {
        let msg = WorkerMessage::task_error(&self.worker_id, error);
        self.write(&msg).await
    }

    /// Send a log message.
    pub async fn send_log(
        &self,
        level: LogLevel,
        content: impl Into<String>,
    ) -> Result<(), IpcClientError> {
        let msg = WorkerMessage::log(&self.worker_id, level, content);
        self.write(&msg).await
    }

    /// Disconnect from the commander.
    pub async fn disconnect(&self) {
        self.teardown().await;
        debug!("Disconnected from commander");
    }

    async fn teardown(&self) {
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
        *self.writer.lock().await = None;
        self.pending.lock().await.clear();
        self.handshake_slot.lock().await.take();
    }
}
