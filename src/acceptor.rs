//! Connection acceptor.
//!
//! Claims exactly one upgrade path and turns every WebSocket accepted on it
//! into a [`ProxySession`]. Requests for any other path are not matched, so
//! the router can be merged into a host application's router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{FramingConfig, ProxyConfig};
use crate::error::BridgeError;
use crate::session::{ProxySession, SessionReport};
use crate::transport::{ServerSocketSink, SocketEvent, WorkerSpawner};

struct Inner {
    proxy_path: String,
    framing: FramingConfig,
    spawner: Arc<dyn WorkerSpawner>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

/// Accepts WebSocket upgrades on the proxy path.
#[derive(Clone)]
pub struct ProxyAcceptor {
    inner: Arc<Inner>,
}

impl ProxyAcceptor {
    /// Create an acceptor.
    ///
    /// Sessions observe `shutdown` and are tracked by `tracker`, so a host
    /// can cancel them and wait for them to finish.
    pub fn new(
        config: &ProxyConfig,
        spawner: Arc<dyn WorkerSpawner>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                proxy_path: config.proxy_path.clone(),
                framing: config.framing,
                spawner,
                shutdown,
                tracker,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The claimed upgrade path.
    pub fn path(&self) -> &str {
        &self.inner.proxy_path
    }

    /// Whether a request for `path` is handled by this acceptor.
    pub fn claims(&self, path: &str) -> bool {
        path == self.inner.proxy_path
    }

    /// Router with the single upgrade route.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.proxy_path, get(upgrade_handler))
            .with_state(self.clone())
    }

    /// Run a session over an already upgraded socket.
    ///
    /// If the host shut down while the upgrade was in flight, the socket is
    /// closed with 1001 and no worker is started.
    pub async fn serve(self, socket: WebSocket) -> SessionReport {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, path = %self.inner.proxy_path, "WebSocket accepted");

        let (sink, stream) = socket.split();
        let inbound = stream.map(|message| message.map(SocketEvent::from).map_err(BridgeError::from));

        let session = ProxySession::new(id, self.inner.framing, self.inner.spawner.clone());
        self.inner
            .tracker
            .track_future(session.run(
                inbound,
                ServerSocketSink::new(sink),
                self.inner.shutdown.child_token(),
            ))
            .await
    }
}

impl std::fmt::Debug for ProxyAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAcceptor")
            .field("path", &self.inner.proxy_path)
            .field("worker", &self.inner.spawner.describe())
            .finish()
    }
}

async fn upgrade_handler(ws: WebSocketUpgrade, State(acceptor): State<ProxyAcceptor>) -> Response {
    if acceptor.inner.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "proxy shutting down").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let report = acceptor.serve(socket).await;
        tracing::debug!(session = report.id, trigger = ?report.trigger, "Session finished");
    })
}
