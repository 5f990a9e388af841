//! Proxy server - serves the bridge on a loopback port.
//!
//! ```text
//! cargo run --example serve                 # copilot --server --stdio
//! cargo run --example serve -- bridge.json  # settings from a JSON file
//! ```
//!
//! Example `bridge.json`:
//!
//! ```json
//! {
//!   "listen_addr": "127.0.0.1:3000",
//!   "proxy_path": "/api/copilot",
//!   "worker": { "program": "node", "args": ["copilot/index.js", "--server", "--stdio"] },
//!   "framing": { "header_policy": "skip" }
//! }
//! ```

use axum::routing::get;
use axum::Router;
use lsp_ws_bridge::{BridgeHost, ProxyConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lsp_ws_bridge=debug,serve=info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::from_json_file(path)?,
        None => ProxyConfig::default(),
    };
    let listen_addr = config.listen_addr.clone();
    let host = BridgeHost::init(config)?;

    // The bridge claims one path; everything else stays with the host app.
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(host.router());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, path = %host.config().proxy_path, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    host.shutdown().await;
    Ok(())
}
