//! Error taxonomy, one layer per concern.
//!
//! `CodecError` covers the wire framing, `ConnectionError` the transport and
//! lifecycle, and `RequestError` the outcome of a single outbound request.
//! Per-request faults reach only that request's waiter; transport faults are
//! broadcast as fault events and cancel every outstanding request.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::message::RequestId;

/// Fault carried in an `ErrorResponse` payload.
///
/// This is the only error type that crosses the wire. Handlers return it to
/// reject a request; callers receive it through
/// [`RequestError::Fault`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteFault {
    pub code: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Inbound request named a method with no registered handler.
    pub fn unknown_method(method: &str) -> Self {
        Self::new("UnknownMethod", method)
    }

    /// A handler returned an error or panicked.
    pub fn handler_fault(detail: impl Into<String>) -> Self {
        Self::new("HandlerFault", detail)
    }

    /// Handshake negotiation rejected the peer.
    pub fn handshake_failed(detail: impl Into<String>) -> Self {
        Self::new("HandshakeFailed", detail)
    }

    /// Wire encoding of this fault. Infallible by construction: the payload
    /// is a two-string object.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "Code": self.code, "Message": self.message })
    }
}

impl Default for RemoteFault {
    fn default() -> Self {
        Self {
            code: String::new(),
            message: String::new(),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for RemoteFault {}

/// Framing faults.
///
/// Any of these observed by the receiver is fatal for the connection: the
/// byte stream can no longer be trusted to be message-aligned.
#[derive(Debug)]
pub enum CodecError {
    /// End of stream landed between a header and its payload.
    TruncatedFrame,
    /// Header was present but structurally unusable.
    MalformedHeader(String),
    /// Header named a `MessageType` outside the closed set.
    UnknownMessageType(String),
    /// Payload or header was not valid JSON at all.
    Json(serde_json::Error),
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedFrame => write!(f, "stream ended inside a frame"),
            Self::MalformedHeader(detail) => write!(f, "malformed header: {detail}"),
            Self::UnknownMessageType(name) => write!(f, "unknown message type '{name}'"),
            Self::Json(e) => write!(f, "invalid JSON: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Transport and lifecycle errors.
#[derive(Debug)]
pub enum ConnectionError {
    /// Operation requires a connected endpoint.
    NotConnected,
    /// `connect` was called twice.
    AlreadyConnected,
    /// Enqueue after the outgoing queue was marked complete.
    ClosedForSend,
    /// Handshake did not complete in either direction.
    HandshakeFailed(String),
    Codec(CodecError),
    Io(io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::ClosedForSend => write!(f, "connection closed for sending"),
            Self::HandshakeFailed(detail) => write!(f, "handshake failed: {detail}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Outcome errors for a single outbound request.
#[derive(Debug)]
pub enum RequestError {
    /// The peer replied with an `ErrorResponse`.
    Fault(RemoteFault),
    /// The caller's cancellation fired.
    Cancelled,
    /// The local per-request timer fired.
    TimedOut,
    /// The connection tore down while the request was outstanding.
    ConnectionClosed,
    /// The request payload could not be serialized.
    Encode(serde_json::Error),
    /// The success payload did not deserialize as the expected type.
    Decode(serde_json::Error),
    /// The request could not be enqueued.
    Send(ConnectionError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "request failed: {fault}"),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::TimedOut => write!(f, "request timed out"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Encode(e) => write!(f, "request payload did not serialize: {e}"),
            Self::Decode(e) => write!(f, "response payload did not deserialize: {e}"),
            Self::Send(e) => write!(f, "request could not be sent: {e}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fault(e) => Some(e),
            Self::Encode(e) | Self::Decode(e) => Some(e),
            Self::Send(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for RequestError {
    fn from(e: ConnectionError) -> Self {
        Self::Send(e)
    }
}

/// Structured fault notification, broadcast to subscribers of
/// [`Connection::faults`](crate::connection::Connection::faults) in addition
/// to being traced.
#[derive(Debug, Clone)]
pub enum FaultEvent {
    /// The receiver hit a framing fault; the connection is closing.
    Codec { detail: String },
    /// The writer task hit an I/O or encode fault; the connection is closing.
    Writer { detail: String },
    /// A terminal response arrived for a request id this endpoint never
    /// issued. The connection continues.
    OrphanResponse { request_id: RequestId },
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec { detail } => write!(f, "codec fault: {detail}"),
            Self::Writer { detail } => write!(f, "writer fault: {detail}"),
            Self::OrphanResponse { request_id } => {
                write!(f, "orphan response for request {request_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_fault_wire_shape() {
        let fault = RemoteFault::unknown_method("Foo");
        let payload = fault.to_payload();
        assert_eq!(payload["Code"], "UnknownMethod");
        assert_eq!(payload["Message"], "Foo");

        let parsed: RemoteFault = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed, fault);
    }

    #[test]
    fn remote_fault_tolerates_empty_object() {
        let parsed: RemoteFault = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed, RemoteFault::default());
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            ConnectionError::ClosedForSend.to_string(),
            "connection closed for sending"
        );
        assert_eq!(
            RequestError::Fault(RemoteFault::unknown_method("Foo")).to_string(),
            "request failed: UnknownMethod: Foo"
        );
        assert_eq!(
            CodecError::TruncatedFrame.to_string(),
            "stream ended inside a frame"
        );
    }
}
