//! Client-side transport.
//!
//! Connects to a proxy endpoint and exposes the same reader/writer pair a
//! session uses: a [`ClientReader`] decoding framed messages from the
//! socket and a [`ClientWriter`] sending one framed message per WebSocket
//! text message.
//!
//! # Example
//!
//! ```no_run
//! use lsp_ws_bridge::client;
//! use lsp_ws_bridge::config::FramingConfig;
//! use serde_json::json;
//!
//! # async fn run() -> lsp_ws_bridge::error::Result<()> {
//! let (reader, writer) =
//!     client::connect("ws://127.0.0.1:3000/api/copilot", FramingConfig::default()).await?;
//! let _subscription = reader.listen(|message| println!("{message}"));
//! writer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "status"}))?;
//! writer.close().await;
//! # Ok(())
//! # }
//! ```

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use crate::config::FramingConfig;
use crate::error::Result;
use crate::reader::{MessageReader, ReaderEvent, ReaderHandle, Subscription};
use crate::transport::{ClientSocketSink, CloseReason, SocketEvent};
use crate::writer::{spawn_writer, MessageWriter, WriteFailure};

/// How the socket ended, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code from the peer's close frame, if one arrived.
    pub code: Option<u16>,
    /// Close reason from the peer, or a description of the failure.
    pub reason: String,
}

/// Connect to `url` and start reading.
///
/// Messages that arrive before a listener is registered are dropped.
///
/// # Errors
///
/// Returns `BridgeError::WebSocket` if the handshake fails.
pub async fn connect(url: &str, framing: FramingConfig) -> Result<(ClientReader, ClientWriter)> {
    let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
    tracing::debug!(url, "Connected");

    let (sink, stream) = socket.split();
    let (writer, _task) = spawn_writer(ClientSocketSink::new(sink), "client-websocket");

    let reader = MessageReader::new(&framing);
    let handle = reader.handle();
    let (closed_tx, closed_rx) = watch::channel(None);
    let pump = tokio::spawn(pump(stream, reader, closed_tx));

    Ok((
        ClientReader {
            handle,
            closed: closed_rx,
            pump,
        },
        ClientWriter { writer },
    ))
}

/// Feed socket messages into the reader until the socket ends.
async fn pump<S>(mut stream: S, mut reader: MessageReader, closed: watch::Sender<Option<CloseInfo>>)
where
    S: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let info = loop {
        let Some(item) = stream.next().await else {
            break CloseInfo {
                code: None,
                reason: "stream ended".to_string(),
            };
        };

        match item.map(SocketEvent::from) {
            Ok(SocketEvent::Data(chunk)) => {
                if let Err(err) = reader.on_data(chunk.as_bytes()).await {
                    tracing::warn!(error = %err, "Dropping connection after framing error");
                    let reason = err.to_string();
                    reader.fire_error(err);
                    break CloseInfo { code: None, reason };
                }
            }
            Ok(SocketEvent::Control) => {}
            Ok(SocketEvent::Closed(frame)) => {
                tracing::debug!(frame = ?frame, "Server closed the connection");
                break match frame {
                    Some((code, reason)) => CloseInfo {
                        code: Some(code),
                        reason,
                    },
                    None => CloseInfo {
                        code: None,
                        reason: String::new(),
                    },
                };
            }
            Err(err) => {
                tracing::warn!(error = %err, "WebSocket error");
                let reason = err.to_string();
                reader.fire_error(err.into());
                break CloseInfo { code: None, reason };
            }
        }
    };

    reader.fire_close();
    let _ = closed.send(Some(info));
}

/// Receiving half of a client connection.
pub struct ClientReader {
    handle: ReaderHandle,
    closed: watch::Receiver<Option<CloseInfo>>,
    pump: JoinHandle<()>,
}

impl ClientReader {
    /// Replace the message listener.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.handle.listen(callback)
    }

    /// Replace the error/close observer.
    pub fn on_event<F>(&self, callback: F)
    where
        F: FnMut(&ReaderEvent) + Send + 'static,
    {
        self.handle.on_event(callback);
    }

    /// Wait until the socket has closed.
    pub async fn closed(&self) -> CloseInfo {
        let mut closed = self.closed.clone();
        let info = match closed.wait_for(Option::is_some).await {
            Ok(info) => info.clone().unwrap_or_else(unknown_close),
            Err(_) => unknown_close(),
        };
        info
    }
}

fn unknown_close() -> CloseInfo {
    CloseInfo {
        code: None,
        reason: "reader stopped".to_string(),
    }
}

impl Drop for ClientReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for ClientReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientReader")
            .field("closed", &self.closed.borrow().is_some())
            .finish()
    }
}

/// Sending half of a client connection.
#[derive(Debug, Clone)]
pub struct ClientWriter {
    writer: MessageWriter,
}

impl ClientWriter {
    /// Frame `message` and send it as one text message.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ConnectionClosed` once the socket is closed.
    pub fn send(&self, message: Value) -> Result<()> {
        self.writer.send(message)
    }

    /// Serialize any value and send it.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), plus serialization failures.
    pub fn send_as<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        self.writer.send_as(message)
    }

    /// End the outgoing stream. The socket stays open.
    pub fn end(&self) {
        self.writer.close();
    }

    /// Close the socket with a normal close frame.
    pub async fn close(&self) {
        self.writer.close_channel(CloseReason::Normal).await;
    }

    /// Replace the send failure observer.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&WriteFailure) + Send + Sync + 'static,
    {
        self.writer.on_error(observer);
    }

    /// Failed sends so far.
    pub fn failure_count(&self) -> usize {
        self.writer.failure_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::protocol::encode_message;

    fn text(message: &Value) -> std::result::Result<tungstenite::Message, tungstenite::Error> {
        let frame = encode_message(message).unwrap();
        Ok(tungstenite::Message::Text(
            String::from_utf8(frame.to_vec()).unwrap().into(),
        ))
    }

    #[tokio::test]
    async fn test_pump_decodes_text_and_binary_then_reports_close() {
        let first = json!({"id": 1});
        let second = json!({"id": 2});
        let binary = encode_message(&second).unwrap();

        let items = vec![
            text(&first),
            Ok(tungstenite::Message::Ping(Default::default())),
            Ok(tungstenite::Message::Binary(binary)),
            Ok(tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
                code: 1000.into(),
                reason: "Child process exited".to_string().into(),
            }))),
        ];

        let reader = MessageReader::new(&FramingConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let received = received.clone();
            reader.listen(move |message| received.lock().unwrap().push(message))
        };
        {
            let events = events.clone();
            reader.on_event(move |event| {
                events
                    .lock()
                    .unwrap()
                    .push(matches!(event, ReaderEvent::Closed));
            });
        }

        let (tx, mut rx) = watch::channel(None);
        pump(stream::iter(items), reader, tx).await;

        assert_eq!(*received.lock().unwrap(), vec![first, second]);
        assert_eq!(*events.lock().unwrap(), vec![true]);
        let info = rx.borrow_and_update().clone().unwrap();
        assert_eq!(info.code, Some(1000));
        assert_eq!(info.reason, "Child process exited");
    }

    #[tokio::test]
    async fn test_pump_reports_socket_error() {
        let items = vec![Err(tungstenite::Error::ConnectionClosed)];

        let reader = MessageReader::new(&FramingConfig::default());
        let errors = Arc::new(Mutex::new(0));
        {
            let errors = errors.clone();
            reader.on_event(move |event| {
                if matches!(event, ReaderEvent::Error(_)) {
                    *errors.lock().unwrap() += 1;
                }
            });
        }

        let (tx, rx) = watch::channel(None);
        pump(stream::iter(items), reader, tx).await;

        assert_eq!(*errors.lock().unwrap(), 1);
        assert_eq!(rx.borrow().as_ref().unwrap().code, None);
    }

    #[tokio::test]
    async fn test_closed_waits_for_close_info() {
        let reader = MessageReader::new(&FramingConfig::default());
        let (tx, rx) = watch::channel(None);
        let client = ClientReader {
            handle: reader.handle(),
            closed: rx,
            pump: tokio::spawn(async {}),
        };

        let expected = CloseInfo {
            code: Some(1001),
            reason: "Proxy shutting down".to_string(),
        };
        tx.send(Some(expected.clone())).unwrap();

        assert_eq!(client.closed().await, expected);
        // Repeated waits see the same outcome.
        assert_eq!(client.closed().await.code, Some(1001));
    }

    #[tokio::test]
    async fn test_closed_after_pump_vanishes() {
        let reader = MessageReader::new(&FramingConfig::default());
        let (tx, rx) = watch::channel(None);
        let client = ClientReader {
            handle: reader.handle(),
            closed: rx,
            pump: tokio::spawn(async {}),
        };
        drop(tx);

        let info = client.closed().await;
        assert_eq!(info.code, None);
        assert_eq!(info.reason, "reader stopped");
    }

    #[tokio::test]
    async fn test_connect_refused_is_websocket_error() {
        let result = connect("ws://127.0.0.1:1/api/copilot", FramingConfig::default()).await;
        assert!(matches!(result, Err(crate::error::BridgeError::WebSocket(_))));
    }
}
