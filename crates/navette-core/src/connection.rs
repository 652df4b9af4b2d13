//! The connection: binds the sender, receiver, request table, and handler
//! registry into a bidirectional RPC channel over one duplex byte stream.
//!
//! Only the dispatch loop consumes receive events, and the outgoing queue is
//! the only path to the write half. Inbound requests are spawned onto worker
//! tasks so a slow handler never stalls reading; a handler panic becomes an
//! `ErrorResponse` for its request, never a dead connection.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::cancel::CancelToken;
use crate::codec::Framing;
use crate::error::{ConnectionError, FaultEvent, RemoteFault, RequestError};
use crate::event::ConnectionEvent;
use crate::handler::{HandlerRegistry, Responder};
use crate::handshake::{self, HandshakeRequest, HandshakeResponse, HANDSHAKE_METHOD};
use crate::message::{Message, MessageType, RequestId};
use crate::receiver::Receiver;
use crate::requests::{
    run_timeout, CancelReason, DeadlineState, Entry, Outcome, RequestOptions, RequestTable,
};
use crate::sender::{Outbox, Sender};

/// Lifecycle of a connection. Transitions are monotonic; no state is
/// re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadyToConnect,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadyToConnect => "ready-to-connect",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Wire framing; both peers must agree out of band.
    pub framing: Framing,
    /// Protocol version advertised in the handshake.
    pub protocol_version: u32,
    /// Oldest protocol version accepted in the handshake.
    pub min_protocol_version: u32,
    /// Upper bound on the whole handshake exchange.
    pub handshake_timeout: Duration,
    /// Timeout applied to requests whose options carry none.
    pub default_request_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            protocol_version: handshake::PROTOCOL_VERSION,
            min_protocol_version: handshake::MIN_PROTOCOL_VERSION,
            handshake_timeout: Duration::from_secs(10),
            default_request_timeout: None,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A bidirectional RPC endpoint over a reader/writer pair supplied by the
/// embedder. Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    handlers: HandlerRegistry,
    local_handshake: HandshakeRequest,
    table: Arc<RequestTable>,
    sender: Sender,
    receiver: Receiver,
    outbox: Outbox,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    faults: broadcast::Sender<FaultEvent>,
    /// Inbound requests currently executing, for `Cancel` routing.
    inbound: Mutex<HashMap<RequestId, CancelToken>>,
    /// Trips when the built-in handler has serviced the peer's handshake.
    remote_handshake: Arc<watch::Sender<bool>>,
}

impl Connection {
    /// Build a connection over `reader`/`writer` with an immutable handler
    /// registry. Nothing touches the streams until [`connect`](Self::connect).
    ///
    /// Registrations under the reserved `Handshake` method are replaced by
    /// the built-in implementation.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        handlers: HandlerRegistry,
        options: ConnectionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let remote_handshake = Arc::new(watch::Sender::new(false));
        let local_handshake = HandshakeRequest {
            protocol_version: options.protocol_version,
            min_protocol_version: options.min_protocol_version,
            methods: handlers
                .method_names()
                .into_iter()
                .filter(|m| m != HANDSHAKE_METHOD)
                .collect(),
        };

        let mut handlers = handlers;
        handlers.register(
            HANDSHAKE_METHOD,
            handshake::built_in_handler(local_handshake.clone(), remote_handshake.clone()),
        );

        let sender = Sender::new(options.framing);
        let outbox = sender.outbox();
        let receiver = Receiver::new(options.framing);
        let (faults, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                options,
                state: watch::Sender::new(ConnectionState::ReadyToConnect),
                handlers,
                local_handshake,
                table: Arc::new(RequestTable::new()),
                sender,
                receiver,
                outbox,
                io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
                faults,
                inbound: Mutex::new(HashMap::new()),
                remote_handshake,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to structured fault notifications. Only events after the
    /// subscription are delivered.
    pub fn faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.inner.faults.subscribe()
    }

    /// Start the pipelines and perform the mandatory symmetric handshake.
    ///
    /// Returns once this endpoint's handshake request has been answered
    /// *and* the peer's handshake request has been serviced locally. Either
    /// direction failing yields `HandshakeFailed` and the connection goes
    /// straight to `Closed`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if !inner.transition(ConnectionState::ReadyToConnect, ConnectionState::Connecting) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let Some((reader, writer)) = inner.io.lock().take() else {
            return Err(ConnectionError::AlreadyConnected);
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        inner.sender.connect(writer, events_tx.clone())?;
        inner.receiver.connect(reader, events_tx)?;
        tokio::spawn(dispatch_loop(inner.clone(), events_rx));

        match self.perform_handshake().await {
            Ok(version) => {
                inner.transition(ConnectionState::Connecting, ConnectionState::Connected);
                tracing::debug!(version, "connection established");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed; closing");
                inner.receiver.close();
                inner.sender.close().await;
                inner.table.resolve_all(CancelReason::ConnectionClosed);
                inner.state.send_replace(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    async fn perform_handshake(&self) -> Result<u32, ConnectionError> {
        let inner = &self.inner;
        let payload = serde_json::to_value(&inner.local_handshake)
            .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
        let mut latch = inner.remote_handshake.subscribe();
        let options = RequestOptions::with_timeout(inner.options.handshake_timeout);

        let exchange = tokio::time::timeout(inner.options.handshake_timeout, async {
            let outgoing = send_request_value(inner, HANDSHAKE_METHOD, payload, options, None, true);
            let (response, latched) = tokio::join!(outgoing, latch.wait_for(|ready| *ready));
            let response =
                response.map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
            latched.map_err(|_| {
                ConnectionError::HandshakeFailed(
                    "connection closed before the remote handshake arrived".into(),
                )
            })?;
            let response: HandshakeResponse = serde_json::from_value(response)
                .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;
            Ok(response.protocol_version)
        })
        .await;

        match exchange {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeFailed("handshake timed out".into())),
        }
    }

    /// Send a request and wait for its terminal response, deserialized as
    /// `TRes`.
    pub async fn send_request<TReq, TRes>(
        &self,
        method: &str,
        payload: &TReq,
    ) -> Result<TRes, RequestError>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        self.send_request_with(method, payload, RequestOptions::default())
            .await
    }

    /// [`send_request`](Self::send_request) with explicit timeout,
    /// keep-alive, and cancellation options.
    pub async fn send_request_with<TReq, TRes>(
        &self,
        method: &str,
        payload: &TReq,
        options: RequestOptions,
    ) -> Result<TRes, RequestError>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(RequestError::Encode)?;
        let value = send_request_value(&self.inner, method, payload, options, None, false).await?;
        serde_json::from_value(value).map_err(RequestError::Decode)
    }

    /// Like [`send_request_with`](Self::send_request_with), additionally
    /// streaming the peer's intermediate results into `updates` while the
    /// request is in flight.
    pub async fn send_request_with_updates<TReq, TRes>(
        &self,
        method: &str,
        payload: &TReq,
        options: RequestOptions,
        updates: mpsc::UnboundedSender<Value>,
    ) -> Result<TRes, RequestError>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(RequestError::Encode)?;
        let value =
            send_request_value(&self.inner, method, payload, options, Some(updates), false).await?;
        serde_json::from_value(value).map_err(RequestError::Decode)
    }

    /// Enqueue a single `Close` directive to the peer. Does not tear down
    /// the local endpoint; pair with [`close`](Self::close).
    pub fn send_close_message(&self) -> Result<(), ConnectionError> {
        self.inner.outbox.send(Message::close())
    }

    /// Close the connection: drain the outgoing queue, stop the receiver,
    /// and resolve every outstanding request cancelled with
    /// `ConnectionClosed`. Idempotent; concurrent callers await the same
    /// close, and closing an already-closed connection returns immediately.
    pub async fn close(&self) {
        if self
            .inner
            .transition(ConnectionState::ReadyToConnect, ConnectionState::Closed)
        {
            return;
        }
        begin_close(&self.inner);
        self.wait_for_close().await;
    }

    /// Resolve once the connection reaches `Closed`, however that happens.
    pub async fn wait_for_close(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Compare-and-set state transition. Returns whether it took effect.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn fault(&self, event: FaultEvent) {
        tracing::warn!(fault = %event, "connection fault");
        let _ = self.faults.send(event);
    }
}

/// Move to `Closing` and spawn the teardown, once.
fn begin_close(inner: &Arc<Inner>) {
    let initiated = inner.transition(ConnectionState::Connected, ConnectionState::Closing)
        || inner.transition(ConnectionState::Connecting, ConnectionState::Closing);
    if initiated {
        tokio::spawn(finish_close(inner.clone()));
    }
}

async fn finish_close(inner: Arc<Inner>) {
    // Drain whatever was enqueued before the close, then stop reading.
    inner.sender.close().await;
    inner.receiver.close();
    inner.table.resolve_all(CancelReason::ConnectionClosed);
    let inbound: Vec<CancelToken> = inner
        .inbound
        .lock()
        .drain()
        .map(|(_, token)| token)
        .collect();
    for token in inbound {
        token.cancel();
    }
    inner.transition(ConnectionState::Closing, ConnectionState::Closed);
    tracing::debug!("connection closed");
}

async fn dispatch_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Received(message) => dispatch_message(&inner, message),
            ConnectionEvent::ReceiverFault(e) => {
                inner.fault(FaultEvent::Codec {
                    detail: e.to_string(),
                });
                begin_close(&inner);
            }
            ConnectionEvent::WriterFault(detail) => {
                inner.fault(FaultEvent::Writer { detail });
                begin_close(&inner);
            }
            ConnectionEvent::ReceiverClosed => {
                tracing::debug!("peer closed the stream");
                begin_close(&inner);
            }
        }
    }
}

/// Constant-time routing of one received message. Handler execution is
/// offloaded; nothing here blocks.
fn dispatch_message(inner: &Arc<Inner>, message: Message) {
    let id = message.request_id();
    match message.message_type() {
        MessageType::Request => dispatch_request(inner, message),
        MessageType::SuccessResponse => {
            resolve_response(inner, id, Outcome::Success(message.payload));
        }
        MessageType::ErrorResponse => {
            let fault = serde_json::from_value::<RemoteFault>(message.payload.clone())
                .unwrap_or_else(|_| RemoteFault::new("Error", message.payload.to_string()));
            resolve_response(inner, id, Outcome::Fault(fault));
        }
        MessageType::IntermediateResultResponse => {
            if !inner.table.deliver_update(id, message.payload) {
                tracing::debug!(request_id = %id, "intermediate result for inactive request dropped");
            }
        }
        MessageType::ProgressResponse => {
            if !inner.table.note_progress(id) {
                tracing::debug!(request_id = %id, "progress for inactive request dropped");
            }
        }
        MessageType::Cancel => {
            let token = inner.inbound.lock().get(&id).cloned();
            match token {
                Some(token) => token.cancel(),
                None => {
                    tracing::debug!(request_id = %id, "cancel for unknown inbound request ignored");
                }
            }
        }
        MessageType::Close => {
            tracing::debug!("close directive received");
            begin_close(inner);
        }
    }
}

fn resolve_response(inner: &Arc<Inner>, id: RequestId, outcome: Outcome) {
    if inner.table.resolve(id, outcome) {
        return;
    }
    if inner.table.was_resolved(id) {
        // Expected race: the peer answered concurrently with a local
        // timeout or cancellation.
        tracing::debug!(request_id = %id, "late response dropped");
    } else {
        inner.fault(FaultEvent::OrphanResponse { request_id: id });
    }
}

fn dispatch_request(inner: &Arc<Inner>, message: Message) {
    let id = message.request_id();
    let method = message.header.method.clone().unwrap_or_default();

    let Some(handler) = inner.handlers.get(&method).cloned() else {
        tracing::warn!(request_id = %id, method = %method, "request for unknown method");
        let fault = RemoteFault::unknown_method(&method);
        let _ = inner
            .outbox
            .send(Message::error(id, Some(method), fault.to_payload()));
        return;
    };

    let cancel = CancelToken::new();
    inner.inbound.lock().insert(id, cancel.clone());
    let responder = Responder::new(id, method.clone(), inner.outbox.clone(), cancel);

    let inner = inner.clone();
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(handler(message.payload, responder))
            .catch_unwind()
            .await;
        inner.inbound.lock().remove(&id);

        let reply = match outcome {
            Ok(Ok(value)) => Message::success(id, Some(method), value),
            Ok(Err(fault)) => Message::error(id, Some(method), fault.to_payload()),
            Err(panic) => {
                let detail = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "handler panicked".to_string()
                };
                tracing::error!(request_id = %id, method = %method, %detail, "handler panicked");
                Message::error(
                    id,
                    Some(method),
                    RemoteFault::handler_fault(detail).to_payload(),
                )
            }
        };

        if inner.outbox.send(reply).is_err() {
            tracing::debug!(request_id = %id, "response dropped: connection is closing");
        }
    });
}

/// The outbound request path. The table insert happens-before the enqueue so
/// a racing response can never miss the waiter.
async fn send_request_value(
    inner: &Arc<Inner>,
    method: &str,
    payload: Value,
    options: RequestOptions,
    updates: Option<mpsc::UnboundedSender<Value>>,
    during_connect: bool,
) -> Result<Value, RequestError> {
    let state = *inner.state.borrow();
    let allowed = state == ConnectionState::Connected
        || (during_connect && state == ConnectionState::Connecting);
    if !allowed {
        return Err(RequestError::Send(ConnectionError::NotConnected));
    }

    let message = Message::request(method, payload);
    let id = message.request_id();

    let timeout = options.timeout.or(inner.options.default_request_timeout);
    let deadline = timeout.map(DeadlineState::starting_now);

    let (waiter_tx, waiter_rx) = oneshot::channel();
    inner.table.insert(
        id,
        Entry {
            method: method.to_string(),
            waiter: waiter_tx,
            keep_alive: options.keep_alive,
            deadline: deadline.clone(),
            timer: None,
            updates,
        },
    );
    // Armed after the insert: a timer must never fire into a missing entry.
    if let Some(deadline) = deadline {
        let table = inner.table.clone();
        let outbox = inner.outbox.clone();
        let timer = tokio::spawn(run_timeout(table, id, deadline, move || {
            let _ = outbox.send(Message::cancel(id));
        }));
        inner.table.arm_timer(id, timer);
    }

    if let Err(e) = inner.outbox.send(message) {
        inner
            .table
            .resolve(id, Outcome::Cancelled(CancelReason::ConnectionClosed));
        return Err(RequestError::Send(e));
    }
    tracing::debug!(request_id = %id, method, "request sent");

    let cancel = options.cancel;
    tokio::select! {
        outcome = waiter_rx => match outcome {
            Ok(Outcome::Success(value)) => Ok(value),
            Ok(Outcome::Fault(fault)) => Err(RequestError::Fault(fault)),
            Ok(Outcome::Cancelled(CancelReason::Timeout)) => Err(RequestError::TimedOut),
            Ok(Outcome::Cancelled(CancelReason::Caller)) => Err(RequestError::Cancelled),
            Ok(Outcome::Cancelled(CancelReason::ConnectionClosed)) | Err(_) => {
                Err(RequestError::ConnectionClosed)
            }
        },
        _ = cancel.cancelled() => {
            if inner.table.resolve(id, Outcome::Cancelled(CancelReason::Caller)) {
                let _ = inner.outbox.send(Message::cancel(id));
            }
            Err(RequestError::Cancelled)
        }
    }
}
