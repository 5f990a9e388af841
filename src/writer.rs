//! Dedicated writer task per channel.
//!
//! Each channel (worker stdin, WebSocket) gets one writer task that owns
//! the sink. [`MessageWriter`] handles are cheap to clone and hand frames
//! to the task over an unbounded mpsc channel, so `send` never blocks the
//! caller (readers deliver messages from synchronous listeners).
//!
//! # Architecture
//!
//! ```text
//! Reader listener ─┐
//! Session        ──┼─► mpsc::UnboundedSender<Outbound> ─► Writer Task ─► Sink
//! Caller         ──┘
//! ```
//!
//! Delivery is at-most-once: a failed write is counted and reported to the
//! error observer, never retried. The proxy applies no flow control of its
//! own; the channel queues whatever the sink has not drained yet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::encode_message;
use crate::transport::CloseReason;

/// Byte channel a writer task drives.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Transmit one complete frame.
    async fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Signal end-of-stream without tearing the channel down.
    async fn finish(&mut self) -> Result<()>;

    /// Close the channel, telling the peer why.
    ///
    /// Closing an already closed channel must succeed.
    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        let _ = reason;
        self.finish().await
    }
}

/// A failed send, as reported to the error observer.
#[derive(Debug)]
pub struct WriteFailure {
    /// What went wrong.
    pub error: BridgeError,
    /// The message that was not delivered, when known.
    pub message: Option<Value>,
    /// Failures on this writer so far, this one included.
    pub count: usize,
}

/// Observer for [`WriteFailure`]s.
pub type ErrorObserver = Arc<dyn Fn(&WriteFailure) + Send + Sync>;

enum Outbound {
    Frame { frame: Bytes, message: Option<Value> },
    Finish,
    Close {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    label: &'static str,
    failures: AtomicUsize,
    observer: Mutex<Option<ErrorObserver>>,
}

impl Shared {
    fn record(&self, error: BridgeError, message: Option<Value>) {
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(channel = self.label, count, error = %error, "Send failed");

        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(&WriteFailure {
                error,
                message,
                count,
            });
        }
    }
}

/// Copy of an encode error for the observer, keeping its variant.
fn same_kind(err: &BridgeError) -> BridgeError {
    match err {
        BridgeError::Json(inner) => {
            BridgeError::Json(<serde_json::Error as serde::ser::Error>::custom(inner))
        }
        other => BridgeError::Protocol(other.to_string()),
    }
}

/// Handle for sending messages to one channel's writer task.
#[derive(Clone)]
pub struct MessageWriter {
    tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl MessageWriter {
    /// Encode `message` and queue exactly one frame for transmission.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ConnectionClosed` if the writer task is gone.
    /// The failure is also counted and reported to the observer.
    pub fn send(&self, message: Value) -> Result<()> {
        match encode_message(&message) {
            Ok(frame) => self.enqueue(frame, Some(message)),
            Err(err) => {
                self.shared.record(same_kind(&err), Some(message));
                Err(err)
            }
        }
    }

    /// Serialize any value and send it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Json` when the value is not representable as
    /// JSON, or the errors of [`send`](Self::send).
    pub fn send_as<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        match serde_json::to_value(message) {
            Ok(value) => self.send(value),
            Err(err) => {
                let err = BridgeError::Json(err);
                self.shared.record(same_kind(&err), None);
                Err(err)
            }
        }
    }

    /// Queue an already framed byte sequence.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.enqueue(frame, None)
    }

    fn enqueue(&self, frame: Bytes, message: Option<Value>) -> Result<()> {
        if let Err(mpsc::error::SendError(outbound)) = self.tx.send(Outbound::Frame { frame, message }) {
            let message = match outbound {
                Outbound::Frame { message, .. } => message,
                _ => None,
            };
            self.shared.record(BridgeError::ConnectionClosed, message);
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(())
    }

    /// Signal end-of-stream after every frame queued so far.
    ///
    /// The channel itself stays owned by whoever created the writer.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Finish);
    }

    /// Close the channel with `reason` once queued frames are written.
    ///
    /// Resolves when the sink has been closed, or immediately if the
    /// writer task already stopped.
    pub(crate) async fn close_channel(&self, reason: CloseReason) {
        let (done, closed) = oneshot::channel();
        if self.tx.send(Outbound::Close { reason, done }).is_ok() {
            let _ = closed.await;
        }
    }

    /// Replace the error observer.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&WriteFailure) + Send + Sync + 'static,
    {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Failed sends so far.
    pub fn failure_count(&self) -> usize {
        self.shared.failures.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("channel", &self.shared.label)
            .field("failures", &self.failure_count())
            .finish()
    }
}

/// Spawn the writer task for `sink` and return a handle for sending.
///
/// The task ends after a close request, or once every handle is dropped.
pub fn spawn_writer<S: FrameSink>(sink: S, label: &'static str) -> (MessageWriter, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        label,
        failures: AtomicUsize::new(0),
        observer: Mutex::new(None),
    });

    let task = tokio::spawn(writer_loop(rx, sink, shared.clone()));

    (MessageWriter { tx, shared }, task)
}

/// Main writer loop - one write per queued frame.
async fn writer_loop<S: FrameSink>(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sink: S,
    shared: Arc<Shared>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame { frame, message } => {
                if let Err(err) = sink.send_frame(frame).await {
                    shared.record(err, message);
                }
            }
            Outbound::Finish => {
                if let Err(err) = sink.finish().await {
                    tracing::debug!(channel = shared.label, error = %err, "End-of-stream failed");
                }
            }
            Outbound::Close { reason, done } => {
                if let Err(err) = sink.close(reason).await {
                    tracing::debug!(channel = shared.label, error = %err, "Close failed");
                }
                let _ = done.send(());
                break;
            }
        }
    }
    tracing::trace!(channel = shared.label, "Writer task stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::protocol::FrameBuffer;

    #[derive(Default)]
    struct Recorded {
        frames: Vec<Bytes>,
        finished: usize,
        closed: Option<CloseReason>,
    }

    /// Sink recording everything; fails sends when `fail` is set.
    struct RecordingSink {
        log: Arc<Mutex<Recorded>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
            if self.fail {
                return Err(BridgeError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.log.lock().unwrap().frames.push(frame);
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            self.log.lock().unwrap().finished += 1;
            Ok(())
        }

        async fn close(&mut self, reason: CloseReason) -> Result<()> {
            self.log.lock().unwrap().closed = Some(reason);
            Ok(())
        }
    }

    fn recording(fail: bool) -> (RecordingSink, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        (
            RecordingSink {
                log: log.clone(),
                fail,
            },
            log,
        )
    }

    #[tokio::test]
    async fn test_send_writes_one_frame_per_message() {
        let (sink, log) = recording(false);
        let (writer, task) = spawn_writer(sink, "test");

        writer.send(json!({"id": 1})).unwrap();
        writer.send(json!({"id": 2})).unwrap();
        writer.close_channel(CloseReason::Shutdown).await;
        task.await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.frames.len(), 2);
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        for frame in &log.frames {
            decoded.extend(buffer.push(frame).unwrap());
        }
        assert_eq!(decoded, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(log.closed, Some(CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_and_reported() {
        let (sink, _log) = recording(true);
        let (writer, task) = spawn_writer(sink, "test");

        let reports = Arc::new(Mutex::new(Vec::new()));
        let seen = reports.clone();
        writer.on_error(move |failure| {
            seen.lock()
                .unwrap()
                .push((failure.message.clone(), failure.count));
        });

        writer.send(json!("a")).unwrap();
        writer.send(json!("b")).unwrap();
        writer.close_channel(CloseReason::Shutdown).await;
        task.await.unwrap();

        assert_eq!(writer.failure_count(), 2);
        let reports = reports.lock().unwrap();
        assert_eq!(
            *reports,
            vec![(Some(json!("a")), 1), (Some(json!("b")), 2)]
        );
    }

    #[tokio::test]
    async fn test_send_after_task_stopped_fails() {
        let (sink, _log) = recording(false);
        let (writer, task) = spawn_writer(sink, "test");

        writer.close_channel(CloseReason::Shutdown).await;
        task.await.unwrap();

        let result = writer.send(json!(1));
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));
        assert_eq!(writer.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_close_signals_end_of_stream_only() {
        let (sink, log) = recording(false);
        let (writer, _task) = spawn_writer(sink, "test");

        writer.send(json!(1)).unwrap();
        writer.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.frames.len(), 1);
        assert_eq!(log.finished, 1);
        assert_eq!(log.closed, None);
    }

    #[tokio::test]
    async fn test_send_as_surfaces_encode_errors() {
        use std::collections::HashMap;

        let (sink, _log) = recording(false);
        let (writer, _task) = spawn_writer(sink, "test");

        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");

        assert!(matches!(writer.send_as(&bad), Err(BridgeError::Json(_))));
        assert_eq!(writer.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_same_error_kind_as_caller() {
        use std::collections::HashMap;

        let (sink, log) = recording(false);
        let (writer, _task) = spawn_writer(sink, "test");

        let reported = Arc::new(Mutex::new(Vec::new()));
        {
            let reported = reported.clone();
            writer.on_error(move |failure| {
                reported.lock().unwrap().push((
                    matches!(failure.error, BridgeError::Json(_)),
                    failure.error.to_string(),
                ));
            });
        }

        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");
        let returned = writer.send_as(&bad).unwrap_err();

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].0);
        assert!(matches!(returned, BridgeError::Json(_)));
        assert_eq!(reported[0].1, returned.to_string());
        assert!(log.lock().unwrap().frames.is_empty());
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let (sink, _log) = recording(false);
        let (writer, task) = spawn_writer(sink, "test");

        drop(writer);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
