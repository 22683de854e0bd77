// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestration server for the commander.
//!
//! Listens on a Unix domain socket, accepts worker connections, and turns the
//! wire protocol into typed [`ServerEvent`]s. A connection is anonymous until
//! its first handshake; identity is bound to the connection, never re-read
//! from later message payloads. A background sweep evicts peers that stay
//! silent past the idle threshold.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::{IpcError, IpcResult};
use super::protocol::{
    decode, encode, CommanderMessage, RecordBuffer, SessionConfig, StatusKind, TaskFailure,
    WorkerMessage,
};
use crate::agent::ToolConfirmation;
use crate::types::{TokenUsage, WorkerResult};

/// Default interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Default silence threshold before a connection is considered dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-side orchestration settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between liveness sweeps.
    pub sweep_interval: Duration,
    /// Silence threshold before eviction.
    pub idle_timeout: Duration,
    /// Tools workers may run without a permission round trip.
    pub auto_approve: Vec<String>,
    /// Permission round-trip timeout handed to workers, in milliseconds.
    pub permission_timeout_ms: Option<u64>,
    /// Initial context handed to workers in the handshake ack.
    pub initial_context: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            auto_approve: Vec::new(),
            permission_timeout_ms: None,
            initial_context: None,
        }
    }
}

impl ServerConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auto_approve: self.auto_approve.clone(),
            timeout_ms: self.permission_timeout_ms,
        }
    }
}

/// Typed events surfaced to the commander loop.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A worker completed its handshake.
    WorkerConnected {
        worker_id: String,
        worktree: String,
        branch: String,
        task: String,
        model: Option<String>,
        provider: Option<String>,
    },
    /// An identified worker's connection went away.
    WorkerDisconnected { worker_id: String },
    /// A worker is waiting for a permission decision.
    PermissionRequested {
        worker_id: String,
        /// Correlator to pass to [`OrchestrationServer::respond`].
        request_id: String,
        confirmation: ToolConfirmation,
    },
    /// A worker reported a status change.
    StatusChanged {
        worker_id: String,
        status: StatusKind,
        tokens_used: Option<TokenUsage>,
        message: Option<String>,
    },
    /// A worker finished its task.
    TaskCompleted { worker_id: String, result: WorkerResult },
    /// A worker's task failed.
    TaskFailed { worker_id: String, error: TaskFailure },
    /// A worker emitted log output.
    LogReceived {
        worker_id: String,
        level: super::protocol::LogLevel,
        content: String,
    },
}

/// One accepted connection, identified or not.
struct Connection {
    writer: OwnedWriteHalf,
    /// Set by the first handshake; `None` while anonymous.
    worker_id: Option<String>,
    /// Refreshed on every inbound record.
    last_activity: Instant,
}

struct Shared {
    /// All live connections by connection id.
    connections: RwLock<HashMap<u64, Arc<Mutex<Connection>>>>,
    /// Identified workers: worker id -> connection id.
    by_worker: RwLock<HashMap<String, u64>>,
    /// Per-connection reader tasks, for abort on eviction.
    readers: Mutex<HashMap<u64, JoinHandle<()>>>,
    event_tx: mpsc::Sender<ServerEvent>,
    config: ServerConfig,
}

impl Shared {
    /// Tear down one connection. Removes it from the maps, optionally aborts
    /// its reader, and emits `WorkerDisconnected` if it was identified.
    async fn drop_connection(&self, conn_id: u64, abort_reader: bool) {
        let conn = {
            let mut connections = self.connections.write().await;
            connections.remove(&conn_id)
        };

        if abort_reader {
            let handle = self.readers.lock().await.remove(&conn_id);
            if let Some(handle) = handle {
                handle.abort();
            }
        } else {
            self.readers.lock().await.remove(&conn_id);
        }

        let Some(conn) = conn else { return };
        let worker_id = conn.lock().await.worker_id.clone();
        if let Some(worker_id) = worker_id {
            // Only unregister if the id still maps here; a newer connection
            // may have taken it over.
            let mut by_worker = self.by_worker.write().await;
            if by_worker.get(&worker_id) == Some(&conn_id) {
                by_worker.remove(&worker_id);
            }
            drop(by_worker);

            info!("Worker {} disconnected", worker_id);
            let _ = self
                .event_tx
                .send(ServerEvent::WorkerDisconnected { worker_id })
                .await;
        } else {
            debug!("Anonymous connection {} closed", conn_id);
        }
    }

    async fn write_to(&self, conn: &Arc<Mutex<Connection>>, msg: &CommanderMessage) -> bool {
        let encoded = match encode(msg) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to encode commander message: {}", e);
                return false;
            }
        };
        let mut conn = conn.lock().await;
        if let Err(e) = conn.writer.write_all(encoded.as_bytes()).await {
            debug!("Write to connection failed: {}", e);
            return false;
        }
        conn.writer.flush().await.is_ok()
    }
}

/// Orchestration server for commander-worker communication.
pub struct OrchestrationServer {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Accept loop and sweep, set after start.
    tasks: Vec<JoinHandle<()>>,
    next_conn_id: Arc<AtomicU64>,
    running: bool,
}

impl OrchestrationServer {
    /// Create a new server with default settings.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self::with_config(socket_path, ServerConfig::default())
    }

    /// Create a new server with explicit settings.
    pub fn with_config(socket_path: impl AsRef<Path>, config: ServerConfig) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            shared: Arc::new(Shared {
                connections: RwLock::new(HashMap::new()),
                by_worker: RwLock::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                event_tx: tx,
                config,
            }),
            event_rx: Some(rx),
            tasks: Vec::new(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            running: false,
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Take the event receiver.
    ///
    /// This can only be called once. Use this to process server events in a
    /// separate task.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start listening. Creates the socket's parent directory, removes any
    /// stale socket file, and spawns the accept loop and liveness sweep.
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.running {
            return Err(IpcError::AlreadyRunning);
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Orchestration server listening on {:?}", self.socket_path);

        let shared = Arc::clone(&self.shared);
        let next_id = Arc::clone(&self.next_conn_id);
        self.tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!("Connection {} accepted", conn_id);
                        Self::register_connection(Arc::clone(&shared), conn_id, stream).await;
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        }));

        let shared = Arc::clone(&self.shared);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::sweep(&shared).await;
            }
        }));

        self.running = true;
        Ok(())
    }

    async fn register_connection(shared: Arc<Shared>, conn_id: u64, stream: tokio::net::UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Mutex::new(Connection {
            writer: write_half,
            worker_id: None,
            last_activity: Instant::now(),
        }));

        shared
            .connections
            .write()
            .await
            .insert(conn_id, Arc::clone(&conn));

        let reader_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            Self::read_loop(reader_shared.clone(), conn_id, conn, read_half).await;
            // EOF or read error; clean up without aborting ourselves.
            reader_shared.drop_connection(conn_id, false).await;
        });
        shared.readers.lock().await.insert(conn_id, handle);
    }

    /// Per-connection read loop. Runs until EOF or a read error.
    async fn read_loop(
        shared: Arc<Shared>,
        conn_id: u64,
        conn: Arc<Mutex<Connection>>,
        mut reader: OwnedReadHalf,
    ) {
        let mut buffer = RecordBuffer::new();
        let mut chunk = [0u8; 4096];

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read error on connection {}: {}", conn_id, e);
                    break;
                }
            };
            buffer.push(&chunk[..n]);

            // Any bytes at all count as liveness.
            conn.lock().await.last_activity = Instant::now();

            for record in buffer.drain_records() {
                let msg = match decode::<WorkerMessage>(&record) {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!("Failed to parse record on connection {}: {}", conn_id, e);
                        continue;
                    }
                };
                Self::handle_message(&shared, conn_id, &conn, msg).await;
            }
        }
    }

    async fn handle_message(
        shared: &Arc<Shared>,
        conn_id: u64,
        conn: &Arc<Mutex<Connection>>,
        msg: WorkerMessage,
    ) {
        // Identity comes from the connection, never from payload fields.
        let identity = conn.lock().await.worker_id.clone();

        let msg = match msg {
            WorkerMessage::Handshake {
                worker_id,
                worktree,
                branch,
                task,
                model,
                provider,
                ..
            } => {
                if identity.is_some() {
                    warn!("Repeat handshake on connection {} ignored", conn_id);
                    return;
                }
                Self::handle_handshake(
                    shared, conn_id, conn, worker_id, worktree, branch, task, model, provider,
                )
                .await;
                return;
            }
            other => other,
        };

        let Some(worker_id) = identity else {
            warn!("Dropping pre-handshake message on connection {}", conn_id);
            return;
        };

        let event = match msg {
            WorkerMessage::Handshake { .. } => return,
            WorkerMessage::PermissionRequest { id, confirmation, .. } => {
                Some(ServerEvent::PermissionRequested {
                    worker_id,
                    request_id: id,
                    confirmation,
                })
            }
            WorkerMessage::StatusUpdate {
                status,
                tokens_used,
                message,
                ..
            } => Some(ServerEvent::StatusChanged {
                worker_id,
                status,
                tokens_used,
                message,
            }),
            WorkerMessage::TaskComplete { result, .. } => {
                Some(ServerEvent::TaskCompleted { worker_id, result })
            }
            WorkerMessage::TaskError { error, .. } => {
                Some(ServerEvent::TaskFailed { worker_id, error })
            }
            WorkerMessage::Log { level, content, .. } => Some(ServerEvent::LogReceived {
                worker_id,
                level,
                content,
            }),
            // Pong carries no payload; its bytes already refreshed liveness.
            WorkerMessage::Pong { .. } => None,
        };

        if let Some(event) = event {
            if shared.event_tx.send(event).await.is_err() {
                warn!("Event receiver dropped");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_handshake(
        shared: &Arc<Shared>,
        conn_id: u64,
        conn: &Arc<Mutex<Connection>>,
        worker_id: String,
        worktree: String,
        branch: String,
        task: String,
        model: Option<String>,
        provider: Option<String>,
    ) {
        // A second connection claiming an already-registered worker id evicts
        // the prior one so no connection is silently orphaned.
        let evicted = {
            let by_worker = shared.by_worker.read().await;
            by_worker.get(&worker_id).copied()
        };
        if let Some(old_conn_id) = evicted {
            warn!(
                "Worker {} reconnected; evicting connection {}",
                worker_id, old_conn_id
            );
            shared.drop_connection(old_conn_id, true).await;
        }

        // Ack before registering: a worker that never received its ack must
        // not surface as connected, and dropping it here must not produce a
        // `WorkerDisconnected` the commander has no `WorkerConnected` for.
        let ack = CommanderMessage::handshake_accept(
            shared.config.session_config(),
            shared.config.initial_context.clone(),
        );
        if !shared.write_to(conn, &ack).await {
            warn!("Failed to ack handshake from {}", worker_id);
            // Called from this connection's own reader; let the read loop
            // terminate on its own instead of aborting ourselves.
            shared.drop_connection(conn_id, false).await;
            return;
        }

        conn.lock().await.worker_id = Some(worker_id.clone());
        shared
            .by_worker
            .write()
            .await
            .insert(worker_id.clone(), conn_id);

        info!("Worker {} connected on branch {}", worker_id, branch);
        let _ = shared
            .event_tx
            .send(ServerEvent::WorkerConnected {
                worker_id,
                worktree,
                branch,
                task,
                model,
                provider,
            })
            .await;
    }

    /// One liveness pass: evict connections idle past the threshold, ping the
    /// rest. Ping failures are left for the next pass to classify.
    async fn sweep(shared: &Arc<Shared>) {
        let now = Instant::now();
        let snapshot: Vec<(u64, Arc<Mutex<Connection>>)> = {
            let connections = shared.connections.read().await;
            connections
                .iter()
                .map(|(id, conn)| (*id, Arc::clone(conn)))
                .collect()
        };

        for (conn_id, conn) in snapshot {
            let idle = now.duration_since(conn.lock().await.last_activity);
            if idle > shared.config.idle_timeout {
                warn!(
                    "Connection {} idle for {:?}, evicting",
                    conn_id, idle
                );
                shared.drop_connection(conn_id, true).await;
            } else {
                let _ = shared.write_to(&conn, &CommanderMessage::ping()).await;
            }
        }
    }

    /// Send a message to an identified worker. Returns whether the write
    /// succeeded; a failed write is left for the sweep to clean up.
    pub async fn send(&self, worker_id: &str, msg: &CommanderMessage) -> bool {
        let conn = {
            let by_worker = self.shared.by_worker.read().await;
            let Some(conn_id) = by_worker.get(worker_id) else {
                debug!("Send to unknown worker {}", worker_id);
                return false;
            };
            let connections = self.shared.connections.read().await;
            connections.get(conn_id).cloned()
        };

        match conn {
            Some(conn) => self.shared.write_to(&conn, msg).await,
            None => false,
        }
    }

    /// Answer a permission request.
    pub async fn respond(
        &self,
        worker_id: &str,
        request_id: &str,
        result: super::protocol::PermissionDecision,
    ) -> bool {
        let msg = CommanderMessage::PermissionResponse {
            id: super::protocol::generate_message_id(),
            timestamp: super::protocol::now(),
            request_id: request_id.to_string(),
            result,
        };
        self.send(worker_id, &msg).await
    }

    /// Broadcast a message to every identified worker, swallowing individual
    /// failures.
    pub async fn broadcast(&self, msg: &CommanderMessage) {
        let conns: Vec<(String, u64)> = {
            let by_worker = self.shared.by_worker.read().await;
            by_worker.iter().map(|(w, c)| (w.clone(), *c)).collect()
        };
        for (worker_id, conn_id) in conns {
            let conn = {
                let connections = self.shared.connections.read().await;
                connections.get(&conn_id).cloned()
            };
            if let Some(conn) = conn {
                if !self.shared.write_to(&conn, msg).await {
                    warn!("Broadcast to worker {} failed", worker_id);
                }
            }
        }
    }

    /// Check if a worker is connected.
    pub async fn is_connected(&self, worker_id: &str) -> bool {
        self.shared.by_worker.read().await.contains_key(worker_id)
    }

    /// Get list of identified worker IDs.
    pub async fn connected_workers(&self) -> Vec<String> {
        self.shared.by_worker.read().await.keys().cloned().collect()
    }

    /// Disconnect a specific worker.
    pub async fn disconnect(&self, worker_id: &str) {
        let conn_id = {
            let by_worker = self.shared.by_worker.read().await;
            by_worker.get(worker_id).copied()
        };
        if let Some(conn_id) = conn_id {
            self.shared.drop_connection(conn_id, true).await;
        }
    }

    /// Stop the server: abort background tasks, drop every connection, and
    /// remove the socket file.
    pub async fn stop(&mut self) -> IpcResult<()> {
        if !self.running {
            return Err(IpcError::NotRunning);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, handle) in self.shared.readers.lock().await.drain() {
            handle.abort();
        }
        self.shared.connections.write().await.clear();
        self.shared.by_worker.write().await.clear();

        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }
        self.running = false;
        info!("Orchestration server stopped");
        Ok(())
    }
}

impl Drop for OrchestrationServer {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
