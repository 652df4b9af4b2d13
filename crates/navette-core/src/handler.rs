//! Inbound request handling: the handler registry and the responder
//! capability handed to running handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{ConnectionError, RemoteFault};
use crate::message::{Message, RequestId};
use crate::sender::Outbox;

/// Future returned by a handler: the response payload, or a fault that the
/// connection relays to the peer as an `ErrorResponse`.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RemoteFault>> + Send>>;

/// A registered handler. Receives the raw request payload and a
/// [`Responder`] for emitting non-terminal responses.
pub type HandlerFn = Arc<dyn Fn(Value, Responder) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`].
///
/// ```ignore
/// let registry = HandlerRegistry::new().with("Echo", handler(|payload, _responder| async move {
///     Ok(payload)
/// }));
/// ```
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Value, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteFault>> + Send + 'static,
{
    Arc::new(move |payload, responder| Box::pin(f(payload, responder)))
}

/// Immutable method-name → handler map, fixed at connection construction.
///
/// The `Handshake` method is reserved: whatever is registered under that
/// name, the connection installs its built-in implementation over it.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, method: impl Into<String>, handler: HandlerFn) -> Self {
        self.register(method, handler);
        self
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<&HandlerFn> {
        self.handlers.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted for stable handshake advertisement.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Capability handle given to a running handler.
///
/// Exposes only what a handler legitimately needs: emitting non-terminal
/// responses for its own request and observing cancellation. It is not a
/// path back to the connection.
#[derive(Clone)]
pub struct Responder {
    request_id: RequestId,
    method: String,
    outbox: Outbox,
    cancel: CancelToken,
}

impl Responder {
    pub(crate) fn new(
        request_id: RequestId,
        method: String,
        outbox: Outbox,
        cancel: CancelToken,
    ) -> Self {
        Self {
            request_id,
            method,
            outbox,
            cancel,
        }
    }

    /// Id of the request this handler is servicing.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Emit a non-terminal intermediate result to the requester.
    pub fn send_intermediate<T: Serialize>(&self, payload: &T) -> Result<(), ConnectionError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| ConnectionError::Codec(crate::error::CodecError::Json(e)))?;
        self.outbox.send(Message::intermediate(
            self.request_id,
            Some(self.method.clone()),
            value,
        ))
    }

    /// Emit a progress notification. For requesters that armed keep-alive,
    /// this resets their request timer.
    pub fn send_progress<T: Serialize>(&self, payload: &T) -> Result<(), ConnectionError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| ConnectionError::Codec(crate::error::CodecError::Json(e)))?;
        self.outbox.send(Message::progress(
            self.request_id,
            Some(self.method.clone()),
            value,
        ))
    }

    /// True once the requester cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve when the requester cancels this request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
