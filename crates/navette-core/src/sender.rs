//! Outgoing pipeline: a FIFO of messages drained by one writer task.
//!
//! The queue is the sole serialization point for the write half. Nothing
//! else writes to the writer, so frames never interleave and messages are
//! emitted in enqueue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{encode_message, Framing};
use crate::error::ConnectionError;
use crate::event::ConnectionEvent;
use crate::message::Message;

enum OutboundItem {
    Frame(Message),
    /// Close marker. Messages enqueued before it still drain; anything after
    /// is refused at the [`Outbox`].
    Shutdown,
}

/// Cheap handle for enqueueing outgoing messages. Held by the connection and
/// by responders; never blocks the caller on I/O.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<OutboundItem>,
    closed: Arc<AtomicBool>,
}

impl Outbox {
    pub(crate) fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::ClosedForSend);
        }
        self.tx
            .send(OutboundItem::Frame(message))
            .map_err(|_| ConnectionError::ClosedForSend)
    }

    /// Mark the queue complete. Idempotent; the first call wins.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(OutboundItem::Shutdown);
        }
    }
}

/// Owns the write half once connected.
pub(crate) struct Sender {
    framing: Framing,
    outbox: Outbox,
    queue: Mutex<Option<mpsc::UnboundedReceiver<OutboundItem>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl Sender {
    pub(crate) fn new(framing: Framing) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            framing,
            outbox: Outbox {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            queue: Mutex::new(Some(rx)),
            task: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Start the writer task over `writer`. Fails with `AlreadyConnected` on
    /// a second call.
    pub(crate) fn connect<W>(
        &self,
        writer: W,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let Some(queue) = self.queue.lock().take() else {
            return Err(ConnectionError::AlreadyConnected);
        };
        let framing = self.framing;
        let handle = tokio::spawn(write_loop(framing, writer, queue, events));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Mark the queue complete, let the writer drain, and wait for it to
    /// exit. Safe to call before `connect` or more than once.
    pub(crate) async fn close(&self) {
        self.outbox.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn write_loop<W>(
    framing: Framing,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<OutboundItem>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = Vec::with_capacity(4096);
    while let Some(item) = queue.recv().await {
        let message = match item {
            OutboundItem::Frame(message) => message,
            OutboundItem::Shutdown => break,
        };

        buf.clear();
        if let Err(e) = encode_message(framing, &message, &mut buf) {
            tracing::error!(
                message_type = %message.message_type(),
                request_id = %message.request_id(),
                error = %e,
                "failed to encode outgoing message"
            );
            let _ = events.send(ConnectionEvent::WriterFault(e.to_string()));
            return;
        }

        // Whole-buffer write followed by a flush keeps the frame atomic at
        // the message boundary.
        let io = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        if let Err(e) = io.await {
            tracing::warn!(error = %e, "writer task exiting on I/O error");
            let _ = events.send(ConnectionEvent::WriterFault(e.to_string()));
            return;
        }

        tracing::trace!(
            message_type = %message.message_type(),
            request_id = %message.request_id(),
            bytes = buf.len(),
            "message written"
        );
    }

    let _ = writer.shutdown().await;
}
