//! Worker process transport.
//!
//! The worker speaks the same Content-Length framing on stdin/stdout.
//! Stderr is not part of the protocol; sessions only log it.
//!
//! Spawning sits behind [`WorkerSpawner`] and the process handle behind
//! [`WorkerProcess`] so sessions can be driven by in-memory fakes.

use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::WorkerCommand;
use crate::error::{BridgeError, Result};
use crate::transport::CloseReason;
use crate::writer::FrameSink;

/// Boxed worker input stream.
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Boxed worker output stream.
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the worker exited normally.
    pub code: Option<i32>,
    /// Whether the exit status reports success.
    pub success: bool,
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Handle on a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if any.
    fn id(&self) -> Option<u32>;

    /// Wait for the worker to exit.
    ///
    /// Must be cancel safe: sessions poll it inside `select!`.
    async fn wait(&mut self) -> io::Result<WorkerExit>;

    /// Ask the worker to terminate without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;
}

/// Piped streams and handle of a freshly spawned worker.
pub struct WorkerIo {
    /// Worker standard input (framed).
    pub stdin: BoxedWrite,
    /// Worker standard output (framed).
    pub stdout: BoxedRead,
    /// Worker standard error (diagnostics only).
    pub stderr: Option<BoxedRead>,
    /// Exit/kill handle.
    pub process: Box<dyn WorkerProcess>,
}

/// Starts one worker per session.
pub trait WorkerSpawner: Send + Sync {
    /// Spawn a worker with piped stdio.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Spawn` if the process cannot be started.
    fn spawn(&self) -> Result<WorkerIo>;

    /// Human readable command line, for logs.
    fn describe(&self) -> String;
}

/// [`WorkerProcess`] backed by a `tokio::process::Child`.
pub struct ChildWorker {
    child: Child,
}

impl ChildWorker {
    /// Wrap a spawned child.
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<WorkerExit> {
        self.child.wait().await.map(WorkerExit::from)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            // Already reaped: nothing left to kill.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Spawn `command` with all three standard streams piped.
///
/// The child is killed if its handle is dropped without being reaped.
///
/// # Errors
///
/// Returns `BridgeError::Spawn` if the program cannot be started, or
/// `BridgeError::Io` if a pipe was not captured.
pub fn spawn_worker(command: &WorkerCommand) -> Result<WorkerIo> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take();

    tracing::debug!(
        program = %command.program,
        pid = ?child.id(),
        "Spawned worker"
    );

    Ok(WorkerIo {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: stderr.map(|s| Box::new(s) as BoxedRead),
        process: Box::new(ChildWorker::new(child)),
    })
}

fn missing_pipe(name: &str) -> BridgeError {
    BridgeError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("worker {name} was not captured"),
    ))
}

/// Spawner running a fixed [`WorkerCommand`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: WorkerCommand,
}

impl CommandSpawner {
    /// Create a spawner for `command`.
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<WorkerIo> {
        spawn_worker(&self.command)
    }

    fn describe(&self) -> String {
        std::iter::once(self.command.program.as_str())
            .chain(self.command.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// [`FrameSink`] writing frames to a worker's standard input.
pub struct StdinSink<W> {
    writer: W,
    finished: bool,
}

impl<W> StdinSink<W> {
    /// Wrap a worker input stream.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            finished: false,
        }
    }
}

#[async_trait]
impl<W> FrameSink for StdinSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.finished {
            return Err(BridgeError::ConnectionClosed);
        }
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn close(&mut self, _reason: CloseReason) -> Result<()> {
        self.finish().await
    }
}
