//! # lsp-ws-bridge
//!
//! Bridges WebSocket clients to stdio worker processes that speak
//! `Content-Length` framed JSON-RPC (the LSP base protocol).
//!
//! Each accepted WebSocket gets its own worker process. Messages are
//! decoded incrementally on both sides and re-framed onto the other side,
//! one message per frame. Either side failing or ending tears the whole
//! session down.
//!
//! ## Architecture
//!
//! - **Protocol**: frame codec and incremental frame buffer
//! - **Reader / Writer**: bounded-batch decoding and per-channel writer tasks
//! - **Transport**: worker stdio and WebSocket sinks
//! - **Session / Acceptor / Host**: the proxy itself
//! - **Client**: the same framing over a tokio-tungstenite connection
//!
//! ## Example
//!
//! ```no_run
//! use lsp_ws_bridge::{BridgeHost, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default().worker("copilot", ["--server", "--stdio"]);
//!     let host = BridgeHost::init(config)?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, host.router()).await?;
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod transport;
pub mod writer;

pub use acceptor::ProxyAcceptor;
pub use config::{FramingConfig, ProxyConfig, WorkerCommand};
pub use error::{BridgeError, Result};
pub use host::BridgeHost;
pub use protocol::HeaderPolicy;
pub use reader::{MessageReader, ReaderEvent, Subscription};
pub use session::{ProxySession, SessionReport, SessionState};
pub use transport::CloseReason;
pub use writer::{spawn_writer, FrameSink, MessageWriter};
