//! Transport module - the two byte channels a session bridges.
//!
//! Provides:
//! - Worker processes: spawning, stdio sinks, exit/kill handling
//! - WebSocket: inbound message normalization, server and client sinks,
//!   close reasons

mod stdio;
mod websocket;

pub use stdio::{
    spawn_worker, BoxedRead, BoxedWrite, ChildWorker, CommandSpawner, StdinSink, WorkerExit,
    WorkerIo, WorkerProcess, WorkerSpawner,
};
pub use websocket::{ClientSocketSink, CloseReason, InboundChunk, ServerSocketSink, SocketEvent};
