//! Process-backed proxy session.
//!
//! One session bridges one WebSocket connection to one worker process:
//! messages decoded from the connection are re-framed onto the worker's
//! stdin, messages decoded from the worker's stdout are re-framed onto the
//! connection.
//!
//! # Lifecycle
//!
//! ```text
//! Spawning ──► Active ──► Closing ──► Closed
//!     │                      ▲
//!     └── spawn failure ─────┘
//! ```
//!
//! Any error or end on either side is fatal to the whole session. The
//! connection side going away kills the worker (at most once); the worker
//! side going away closes the connection with a matching [`CloseReason`].

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FramingConfig;
use crate::error::{BridgeError, Result};
use crate::reader::MessageReader;
use crate::transport::{
    BoxedRead, CloseReason, SocketEvent, StdinSink, WorkerExit, WorkerProcess, WorkerSpawner,
};
use crate::writer::{spawn_writer, FrameSink};

/// Read size for worker stdout.
const STDOUT_CHUNK: usize = 8 * 1024;

/// How long teardown waits for a killed worker to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker is being started.
    Spawning,
    /// Both channels are up and bridged.
    Active,
    /// Teardown in progress.
    Closing,
    /// Worker reaped (or never started) and connection closed.
    Closed,
}

/// Event that started teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownTrigger {
    /// The worker could not be started.
    SpawnFailed,
    /// The worker exited on its own.
    ProcessExited(WorkerExit),
    /// Waiting on or reading from the worker failed.
    ProcessError,
    /// The peer closed the connection.
    ConnectionClosed,
    /// The connection reported an error.
    ConnectionError,
    /// Either side broke the framing contract.
    ProtocolViolation,
    /// The host cancelled the session.
    Shutdown,
}

impl TeardownTrigger {
    /// Close reason sent to the peer, or `None` when the connection is
    /// already gone.
    pub fn close_reason(self) -> Option<CloseReason> {
        match self {
            Self::SpawnFailed | Self::ProcessError => Some(CloseReason::ProcessError),
            Self::ProcessExited(_) => Some(CloseReason::ProcessExited),
            Self::ProtocolViolation => Some(CloseReason::ProtocolViolation),
            Self::Shutdown => Some(CloseReason::Shutdown),
            Self::ConnectionClosed | Self::ConnectionError => None,
        }
    }

    fn worker_exited(self) -> bool {
        matches!(self, Self::ProcessExited(_) | Self::SpawnFailed)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Session id assigned by the acceptor.
    pub id: u64,
    /// Final state; always [`SessionState::Closed`] once `run` returns.
    pub state: SessionState,
    /// What started teardown.
    pub trigger: TeardownTrigger,
    /// Close reason sent to the peer, if any.
    pub close_reason: Option<CloseReason>,
    /// Whether teardown issued a kill to the worker.
    pub worker_killed: bool,
    /// Messages decoded from the connection.
    pub to_worker: usize,
    /// Messages decoded from the worker.
    pub to_client: usize,
}

/// One connection bridged to one worker.
pub struct ProxySession {
    id: u64,
    framing: FramingConfig,
    spawner: Arc<dyn WorkerSpawner>,
    state: SessionState,
}

impl ProxySession {
    /// Create a session that will start its worker through `spawner`.
    pub fn new(id: u64, framing: FramingConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            id,
            framing,
            spawner,
            state: SessionState::Spawning,
        }
    }

    /// Session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(session = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Drive the session until either side ends or `shutdown` fires.
    ///
    /// `inbound` yields the connection's messages; `outbound` is the
    /// connection's sending half. Both are consumed.
    pub async fn run<St, Si>(
        mut self,
        mut inbound: St,
        outbound: Si,
        shutdown: CancellationToken,
    ) -> SessionReport
    where
        St: Stream<Item = Result<SocketEvent>> + Unpin + Send,
        Si: FrameSink,
    {
        let (connection, connection_task) = spawn_writer(outbound, "websocket");

        if shutdown.is_cancelled() {
            tracing::debug!(session = self.id, "Shutdown before worker start");
            self.transition(SessionState::Closing);
            connection.close_channel(CloseReason::Shutdown).await;
            drop(connection);
            let _ = connection_task.await;
            self.transition(SessionState::Closed);
            return SessionReport {
                id: self.id,
                state: self.state,
                trigger: TeardownTrigger::Shutdown,
                close_reason: Some(CloseReason::Shutdown),
                worker_killed: false,
                to_worker: 0,
                to_client: 0,
            };
        }

        let worker = match self.spawner.spawn() {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!(
                    session = self.id,
                    worker = %self.spawner.describe(),
                    error = %err,
                    "Failed to start worker"
                );
                self.transition(SessionState::Closing);
                connection.close_channel(CloseReason::ProcessError).await;
                drop(connection);
                let _ = connection_task.await;
                self.transition(SessionState::Closed);
                return SessionReport {
                    id: self.id,
                    state: self.state,
                    trigger: TeardownTrigger::SpawnFailed,
                    close_reason: Some(CloseReason::ProcessError),
                    worker_killed: false,
                    to_worker: 0,
                    to_client: 0,
                };
            }
        };

        let mut process = worker.process;
        let mut stdout = worker.stdout;
        let stderr_task = worker.stderr.map(|stderr| spawn_stderr_logger(self.id, stderr));
        let (stdin, stdin_task) = spawn_writer(StdinSink::new(worker.stdin), "worker-stdin");

        self.transition(SessionState::Active);
        tracing::info!(
            session = self.id,
            pid = ?process.id(),
            worker = %self.spawner.describe(),
            "Session active"
        );

        let mut from_client = MessageReader::new(&self.framing);
        let to_worker = {
            let stdin = stdin.clone();
            from_client.listen(move |message: Value| {
                let _ = stdin.send(message);
            })
        };

        let mut from_worker = MessageReader::new(&self.framing);
        let to_client = {
            let connection = connection.clone();
            from_worker.listen(move |message: Value| {
                let _ = connection.send(message);
            })
        };

        let mut counts = (0usize, 0usize);
        let mut stdout_open = true;
        let mut chunk = vec![0u8; STDOUT_CHUNK];

        let trigger = loop {
            tokio::select! {
                biased;

                // Worker output and exit are observed before further
                // connection input, so nothing reaches an exited worker.
                _ = shutdown.cancelled() => break TeardownTrigger::Shutdown,

                read = stdout.read(&mut chunk), if stdout_open => match read {
                    // EOF; the exit branch decides what happens next.
                    Ok(0) => stdout_open = false,
                    Ok(n) => match from_worker.on_data(&chunk[..n]).await {
                        Ok(decoded) => counts.1 += decoded,
                        Err(err) => break self.violation("worker", err),
                    },
                    Err(err) => {
                        tracing::error!(session = self.id, error = %err, "Worker stdout failed");
                        break TeardownTrigger::ProcessError;
                    }
                },

                exit = process.wait() => match exit {
                    Ok(exit) => {
                        tracing::info!(session = self.id, code = ?exit.code, "Worker exited");
                        break TeardownTrigger::ProcessExited(exit);
                    }
                    Err(err) => {
                        tracing::error!(session = self.id, error = %err, "Worker wait failed");
                        break TeardownTrigger::ProcessError;
                    }
                },

                event = inbound.next() => match event {
                    Some(Ok(SocketEvent::Data(data))) => {
                        match from_client.on_data(data.as_bytes()).await {
                            Ok(n) => counts.0 += n,
                            Err(err) => break self.violation("connection", err),
                        }
                    }
                    Some(Ok(SocketEvent::Control)) => {}
                    Some(Ok(SocketEvent::Closed(frame))) => {
                        tracing::debug!(session = self.id, frame = ?frame, "Connection closed by peer");
                        break TeardownTrigger::ConnectionClosed;
                    }
                    None => break TeardownTrigger::ConnectionClosed,
                    Some(Err(err)) => {
                        tracing::warn!(session = self.id, error = %err, "Connection error");
                        break TeardownTrigger::ConnectionError;
                    }
                },
            }
        };

        self.transition(SessionState::Closing);

        // Nothing decoded from here on reaches the worker.
        to_worker.dispose();
        to_client.dispose();

        let worker_killed = if trigger.worker_exited() {
            false
        } else {
            kill_and_reap(self.id, process.as_mut()).await;
            true
        };

        stdin.close();
        drop(stdin);
        let _ = stdin_task.await;

        let close_reason = trigger.close_reason();
        if let Some(reason) = close_reason {
            connection.close_channel(reason).await;
        }
        drop(connection);
        connection_task.abort();

        if let Some(task) = stderr_task {
            task.abort();
        }

        self.transition(SessionState::Closed);
        tracing::info!(
            session = self.id,
            trigger = ?trigger,
            close_reason = ?close_reason,
            "Session closed"
        );

        SessionReport {
            id: self.id,
            state: self.state,
            trigger,
            close_reason,
            worker_killed,
            to_worker: counts.0,
            to_client: counts.1,
        }
    }

    fn violation(&self, side: &'static str, err: BridgeError) -> TeardownTrigger {
        if err.is_protocol_violation() {
            tracing::warn!(session = self.id, side, error = %err, "Protocol violation");
            TeardownTrigger::ProtocolViolation
        } else if side == "worker" {
            tracing::error!(session = self.id, error = %err, "Worker stream failed");
            TeardownTrigger::ProcessError
        } else {
            tracing::warn!(session = self.id, error = %err, "Connection stream failed");
            TeardownTrigger::ConnectionError
        }
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("worker", &self.spawner.describe())
            .finish()
    }
}

/// Kill the worker once and wait for it to be reaped.
async fn kill_and_reap(session: u64, process: &mut dyn WorkerProcess) {
    if let Err(err) = process.start_kill() {
        tracing::warn!(session, error = %err, "Failed to kill worker");
        return;
    }
    match tokio::time::timeout(REAP_TIMEOUT, process.wait()).await {
        Ok(Ok(exit)) => tracing::debug!(session, code = ?exit.code, "Worker reaped"),
        Ok(Err(err)) => tracing::warn!(session, error = %err, "Failed to reap worker"),
        Err(_) => tracing::warn!(session, "Worker not reaped in time"),
    }
}

fn spawn_stderr_logger(session: u64, stderr: BoxedRead) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(session, "worker stderr: {line}"),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(session, error = %err, "Worker stderr failed");
                    break;
                }
            }
        }
    })
}
