//! Incoming pipeline: one long-lived reader task.
//!
//! The reader fills a byte buffer from the read half, drains every complete
//! frame through the codec, and publishes each as an event. Hand-off is a
//! non-blocking channel send, so a slow consumer never stalls the read loop
//! and the reader returns to the stream promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameDecoder, Framing};
use crate::error::CodecError;
use crate::event::ConnectionEvent;

const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Owns the read half once connected.
pub(crate) struct Receiver {
    framing: Framing,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl Receiver {
    pub(crate) fn new(framing: Framing) -> Self {
        Self {
            framing,
            closing: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Start the reader task over `reader`.
    pub(crate) fn connect<R>(
        &self,
        reader: R,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<(), crate::error::ConnectionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(crate::error::ConnectionError::AlreadyConnected);
        }
        let framing = self.framing;
        let closing = self.closing.clone();
        let handle = tokio::spawn(read_loop(framing, reader, closing, events));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Flag the reader as closing and tear it down at its next suspension
    /// point. Does not wait: a read blocked on an OS pipe cannot always be
    /// interrupted, so the connection observes reader exit through the event
    /// channel closing instead.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    framing: Framing,
    mut reader: R,
    closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut decoder = FrameDecoder::new(framing);
    let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);

    loop {
        // Drain every complete frame before touching the stream again.
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(message)) => {
                    tracing::trace!(
                        message_type = %message.message_type(),
                        request_id = %message.request_id(),
                        "message received"
                    );
                    if events.send(ConnectionEvent::Received(message)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "reader task exiting on decode fault");
                    let _ = events.send(ConnectionEvent::ReceiverFault(e));
                    return;
                }
            }
        }

        if closing.load(Ordering::Acquire) {
            return;
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                // End of stream. Leftover bytes mean the peer died mid-frame.
                match drain_at_eof(&mut decoder, &mut buf, &events) {
                    Ok(()) => {
                        let _ = events.send(ConnectionEvent::ReceiverClosed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stream ended inside a frame");
                        let _ = events.send(ConnectionEvent::ReceiverFault(e));
                    }
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(ConnectionEvent::ReceiverFault(CodecError::Io(e)));
                return;
            }
        }
    }
}

fn drain_at_eof(
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<(), CodecError> {
    while let Some(message) = decoder.decode_eof(buf)? {
        if events.send(ConnectionEvent::Received(message)).is_err() {
            return Ok(());
        }
    }
    Ok(())
}
