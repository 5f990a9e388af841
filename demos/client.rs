//! Proxy client - sends one request and prints whatever comes back.
//!
//! ```text
//! cargo run --example client -- ws://127.0.0.1:3000/api/copilot
//! ```

use std::time::Duration;

use lsp_ws_bridge::client;
use lsp_ws_bridge::{FramingConfig, ReaderEvent};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lsp_ws_bridge=info".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3000/api/copilot".to_string());

    let (reader, writer) = client::connect(&url, FramingConfig::default()).await?;
    let _subscription = reader.listen(|message| println!("{message:#}"));
    reader.on_event(|event| match event {
        ReaderEvent::Error(err) => eprintln!("error: {err}"),
        ReaderEvent::Closed => eprintln!("closed"),
    });
    writer.on_error(|failure| eprintln!("send failed: {}", failure.error));

    writer.send(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": { "processId": std::process::id(), "capabilities": {} }
    }))?;

    tokio::select! {
        info = reader.closed() => println!("server closed: {info:?}"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => writer.close().await,
    }
    Ok(())
}
