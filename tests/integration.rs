//! Integration tests for lsp-ws-bridge.
//!
//! These tests run the proxy on a loopback listener and drive it with the
//! client transport. Worker processes are plain Unix utilities.

use std::time::Duration;

use lsp_ws_bridge::client::{self, ClientReader};
use lsp_ws_bridge::protocol::{build_frame, encode_message, FrameBuffer};
use lsp_ws_bridge::transport::StdinSink;
use lsp_ws_bridge::{spawn_writer, BridgeHost, FramingConfig, MessageReader, ProxyConfig};
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncReadExt};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Start `host` on an ephemeral port and return the proxy URL.
async fn serve(host: &BridgeHost) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = host.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("ws://{}{}", addr, host.config().proxy_path)
}

fn collect(reader: &ClientReader) -> (mpsc::UnboundedReceiver<Value>, lsp_ws_bridge::Subscription) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = reader.listen(move |message| {
        let _ = tx.send(message);
    });
    (rx, subscription)
}

/// Messages pass through a worker that echoes its stdin.
#[cfg(unix)]
#[tokio::test]
async fn test_round_trip_through_echo_worker() {
    let host = BridgeHost::init(ProxyConfig::default().worker("cat", Vec::<String>::new())).unwrap();
    let url = serve(&host).await;

    let (reader, writer) = client::connect(&url, FramingConfig::default()).await.unwrap();
    let (mut received, _subscription) = collect(&reader);

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "textDocument/completion",
        "params": {"text": "héllo wörld ✓"}
    });
    writer.send(request.clone()).unwrap();

    let echoed = tokio::time::timeout(TIMEOUT, received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, request);

    // Several messages keep their order.
    for id in 2..=20 {
        writer.send(json!({"jsonrpc": "2.0", "id": id})).unwrap();
    }
    for id in 2..=20 {
        let message = tokio::time::timeout(TIMEOUT, received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message["id"], id);
    }

    writer.close().await;
    tokio::time::timeout(TIMEOUT, host.shutdown()).await.unwrap();
    assert_eq!(host.active_sessions(), 0);
}

/// A worker exiting on its own closes the socket with 1000.
#[cfg(unix)]
#[tokio::test]
async fn test_worker_exit_closes_socket() {
    let host = BridgeHost::init(ProxyConfig::default().worker("true", Vec::<String>::new())).unwrap();
    let url = serve(&host).await;

    let (reader, _writer) = client::connect(&url, FramingConfig::default()).await.unwrap();
    let info = tokio::time::timeout(TIMEOUT, reader.closed()).await.unwrap();

    assert_eq!(info.code, Some(1000));
    assert_eq!(info.reason, "Child process exited");
}

/// A worker that cannot be started closes the socket with 1011.
#[tokio::test]
async fn test_spawn_failure_closes_socket_with_error() {
    let config = ProxyConfig::default().worker("no-such-worker-binary-7f3a", Vec::<String>::new());
    let host = BridgeHost::init(config).unwrap();
    let url = serve(&host).await;

    let (reader, _writer) = client::connect(&url, FramingConfig::default()).await.unwrap();
    let info = tokio::time::timeout(TIMEOUT, reader.closed()).await.unwrap();

    assert_eq!(info.code, Some(1011));
    assert_eq!(info.reason, "Child process error");
}

/// Host shutdown closes live sessions with 1001 and kills their workers.
#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_closes_live_sessions() {
    let host = BridgeHost::init(ProxyConfig::default().worker("cat", Vec::<String>::new())).unwrap();
    let url = serve(&host).await;

    let (reader, writer) = client::connect(&url, FramingConfig::default()).await.unwrap();
    let (mut received, _subscription) = collect(&reader);

    // Wait until the session is up.
    writer.send(json!({"ping": true})).unwrap();
    tokio::time::timeout(TIMEOUT, received.recv())
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(TIMEOUT, host.shutdown()).await.unwrap();
    let info = tokio::time::timeout(TIMEOUT, reader.closed()).await.unwrap();

    assert_eq!(info.code, Some(1001));
    assert_eq!(info.reason, "Proxy shutting down");
    assert!(host.is_shut_down());
}

/// Reinitializing moves the proxy to a new path.
#[cfg(unix)]
#[tokio::test]
async fn test_reinitialize_serves_new_path() {
    let host = BridgeHost::init(ProxyConfig::default().worker("cat", Vec::<String>::new())).unwrap();
    host.reinitialize(
        ProxyConfig::default()
            .proxy_path("/lsp")
            .worker("cat", Vec::<String>::new()),
    )
    .await
    .unwrap();
    assert_eq!(host.generation(), 1);

    let url = serve(&host).await;
    assert!(url.ends_with("/lsp"));

    let (reader, writer) = client::connect(&url, FramingConfig::default()).await.unwrap();
    let (mut received, _subscription) = collect(&reader);
    writer.send(json!({"id": 7})).unwrap();
    let echoed = tokio::time::timeout(TIMEOUT, received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed["id"], 7);

    host.shutdown().await;
}

/// Paths other than the proxy path are not upgraded.
#[tokio::test]
async fn test_other_paths_are_not_upgraded() {
    let host = BridgeHost::init(ProxyConfig::default()).unwrap();
    let url = serve(&host).await.replace("/api/copilot", "/api/other");

    let result = client::connect(&url, FramingConfig::default()).await;
    assert!(result.is_err());
    assert_eq!(host.active_sessions(), 0);
}

/// Writer output decodes with the reader, whatever the chunking.
#[tokio::test]
async fn test_writer_to_reader_over_pipe() {
    let (write_end, mut read_end) = duplex(256);
    let (writer, task) = spawn_writer(StdinSink::new(write_end), "pipe");

    let messages: Vec<Value> = (0..250).map(|i| json!({"seq": i, "text": "ü".repeat(i % 7)})).collect();
    for message in &messages {
        writer.send(message.clone()).unwrap();
    }
    writer.close();
    drop(writer);

    let mut reader = MessageReader::new(&FramingConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = reader.listen(move |message| {
        let _ = tx.send(message);
    });

    let mut chunk = [0u8; 37];
    loop {
        let n = read_end.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        reader.on_data(&chunk[..n]).await.unwrap();
    }
    task.await.unwrap();

    let mut decoded = Vec::new();
    while let Ok(message) = rx.try_recv() {
        decoded.push(message);
    }
    assert_eq!(decoded, messages);
    assert_eq!(reader.buffered(), 0);
}

/// A frame built by hand decodes like an encoded one.
#[test]
fn test_hand_built_frame_matches_encoder() {
    let message = json!({"method": "initialized", "params": {}});
    let payload = serde_json::to_vec(&message).unwrap();

    let built = build_frame(&payload);
    let encoded = encode_message(&message).unwrap();
    assert_eq!(built, encoded);

    let mut buffer = FrameBuffer::new();
    let mut stream = built.to_vec();
    stream.extend_from_slice(b"Content-Length: 5\r\n\r\n{bad}");
    stream.extend_from_slice(&encoded);

    let decoded = buffer.push(&stream).unwrap();
    assert_eq!(decoded, vec![message.clone(), message]);
    assert!(buffer.is_empty());
}
