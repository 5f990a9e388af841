//! Incremental message reader.
//!
//! Owns one [`FrameBuffer`] fed by arbitrarily chunked arrivals and hands
//! every decoded message to the registered listener, in byte order.
//!
//! Work per arrival is bounded: a batch runs at most
//! `max_frames_per_tick` decode steps, then the reader yields to the
//! runtime before continuing. Draining always finishes inside the same
//! [`on_data`](MessageReader::on_data) call, so frames are never stranded
//! waiting for the next chunk.
//!
//! # Example
//!
//! ```
//! use lsp_ws_bridge::config::FramingConfig;
//! use lsp_ws_bridge::reader::MessageReader;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut reader = MessageReader::new(&FramingConfig::default());
//! let _subscription = reader.listen(|message| println!("got {message}"));
//! reader.on_data(b"Content-Length: 2\r\n\r\n{}").await.unwrap();
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::config::FramingConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{DiagnosticHook, FrameBuffer};

/// Callback receiving decoded messages.
pub type MessageCallback = Box<dyn FnMut(Value) + Send>;

/// Callback receiving transport events.
pub type EventCallback = Box<dyn FnMut(&ReaderEvent) + Send>;

/// Channel-level events, delivered apart from the message stream.
#[derive(Debug)]
pub enum ReaderEvent {
    /// The underlying channel reported an error.
    Error(BridgeError),
    /// The underlying channel closed.
    Closed,
}

#[derive(Default)]
struct ListenerSlot {
    generation: u64,
    callback: Option<MessageCallback>,
}

#[derive(Default)]
struct Slots {
    listener: Mutex<ListenerSlot>,
    events: Mutex<Option<EventCallback>>,
}

impl Slots {
    fn listener(&self) -> MutexGuard<'_, ListenerSlot> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn events(&self) -> MutexGuard<'_, Option<EventCallback>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listen(self: &Arc<Self>, callback: MessageCallback) -> Subscription {
        let mut slot = self.listener();
        slot.generation += 1;
        slot.callback = Some(callback);
        Subscription {
            slots: Arc::downgrade(self),
            generation: slot.generation,
        }
    }

    /// Deliver one message. Returns `false` if nobody was listening.
    ///
    /// The callback runs outside the lock so it may re-register itself.
    fn deliver(&self, message: Value) -> bool {
        let (generation, callback) = {
            let mut slot = self.listener();
            (slot.generation, slot.callback.take())
        };

        let Some(mut callback) = callback else {
            return false;
        };
        callback(message);

        let mut slot = self.listener();
        if slot.generation == generation && slot.callback.is_none() {
            slot.callback = Some(callback);
        }
        true
    }

    fn fire(&self, event: &ReaderEvent) {
        if let Some(callback) = self.events().as_mut() {
            callback(event);
        }
    }
}

/// Handle returned by [`MessageReader::listen`].
///
/// Dropping or disposing it clears the listener it installed. A handle
/// whose listener has since been replaced does nothing.
#[must_use = "dropping the subscription clears the listener immediately"]
pub struct Subscription {
    slots: std::sync::Weak<Slots>,
    generation: u64,
}

impl Subscription {
    /// Clear the listener now.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            let mut slot = slots.listener();
            if slot.generation == self.generation {
                // Bumped so a delivery in flight does not restore the callback.
                slot.generation += 1;
                slot.callback = None;
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Cloneable registration handle for a reader driven by another task.
#[derive(Clone)]
pub struct ReaderHandle {
    slots: Arc<Slots>,
}

impl ReaderHandle {
    /// Replace the message listener.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.slots.listen(Box::new(callback))
    }

    /// Replace the transport event observer.
    pub fn on_event<F>(&self, callback: F)
    where
        F: FnMut(&ReaderEvent) + Send + 'static,
    {
        *self.slots.events() = Some(Box::new(callback));
    }
}

/// Incremental reader for one direction of one channel.
pub struct MessageReader {
    buffer: FrameBuffer,
    slots: Arc<Slots>,
    max_frames_per_tick: usize,
}

impl MessageReader {
    /// Create a reader using the given framing limits.
    pub fn new(framing: &FramingConfig) -> Self {
        Self {
            buffer: FrameBuffer::with_limits(framing.max_content_length, framing.header_policy),
            slots: Arc::new(Slots::default()),
            max_frames_per_tick: framing.max_frames_per_tick.max(1),
        }
    }

    /// Registration handle usable after the reader moved into a task.
    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            slots: self.slots.clone(),
        }
    }

    /// Replace the message listener.
    ///
    /// Messages decoded while no listener is registered are dropped.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.slots.listen(Box::new(callback))
    }

    /// Replace the transport event observer.
    pub fn on_event<F>(&self, callback: F)
    where
        F: FnMut(&ReaderEvent) + Send + 'static,
    {
        *self.slots.events() = Some(Box::new(callback));
    }

    /// Install a hook for skipped headers and dropped payloads.
    pub fn set_diagnostic(&mut self, hook: DiagnosticHook) {
        self.buffer.set_diagnostic(hook);
    }

    /// Feed one arrival and drain every complete frame.
    ///
    /// Returns the number of messages decoded (delivered or dropped).
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an oversized frame or a rejected
    /// header. The reader should not be fed again afterwards.
    pub async fn on_data(&mut self, chunk: &[u8]) -> Result<usize> {
        self.buffer.extend(chunk);

        let mut decoded = 0;
        loop {
            let (count, more_pending) = self.process_batch()?;
            decoded += count;
            if !more_pending {
                return Ok(decoded);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Run one bounded batch against the buffer.
    ///
    /// Returns `(decoded, more_pending)`; `more_pending` means the step
    /// cap was hit and another batch is needed.
    ///
    /// # Errors
    ///
    /// Same as [`on_data`](Self::on_data).
    pub fn process_batch(&mut self) -> Result<(usize, bool)> {
        let batch = self.buffer.extract_batch(self.max_frames_per_tick)?;
        let decoded = batch.messages.len();

        for message in batch.messages {
            if !self.slots.deliver(message) {
                tracing::trace!("No listener registered, dropping message");
            }
        }

        Ok((decoded, batch.more_pending))
    }

    /// Report a channel error to the event observer.
    pub fn fire_error(&self, error: BridgeError) {
        self.slots.fire(&ReaderEvent::Error(error));
    }

    /// Report channel closure to the event observer.
    pub fn fire_close(&self) {
        self.slots.fire(&ReaderEvent::Closed);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for MessageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("buffer", &self.buffer)
            .field("max_frames_per_tick", &self.max_frames_per_tick)
            .finish_non_exhaustive()
    }
}
