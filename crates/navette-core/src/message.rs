//! Wire message representation.
//!
//! A message is an immutable pair of a typed header and an opaque JSON
//! payload. The codec carries the payload without interpreting it; typed
//! deserialization happens at the edges (request callers and handlers).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Discriminator for every frame on the wire.
///
/// Exactly one of [`SuccessResponse`](MessageType::SuccessResponse) /
/// [`ErrorResponse`](MessageType::ErrorResponse) is terminal for a given
/// request id; intermediate and progress responses are non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    SuccessResponse,
    ErrorResponse,
    IntermediateResultResponse,
    ProgressResponse,
    Cancel,
    Close,
}

impl MessageType {
    /// The wire spelling of this discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::SuccessResponse => "SuccessResponse",
            Self::ErrorResponse => "ErrorResponse",
            Self::IntermediateResultResponse => "IntermediateResultResponse",
            Self::ProgressResponse => "ProgressResponse",
            Self::Cancel => "Cancel",
            Self::Close => "Close",
        }
    }

    /// Parse a wire spelling. Returns `None` for anything outside the
    /// closed set, which the codec reports as an unknown-message-type fault.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Request" => Some(Self::Request),
            "SuccessResponse" => Some(Self::SuccessResponse),
            "ErrorResponse" => Some(Self::ErrorResponse),
            "IntermediateResultResponse" => Some(Self::IntermediateResultResponse),
            "ProgressResponse" => Some(Self::ProgressResponse),
            "Cancel" => Some(Self::Cancel),
            "Close" => Some(Self::Close),
            _ => None,
        }
    }

    /// True for the two discriminators that end a request's lifecycle.
    pub fn is_terminal_response(&self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 128-bit identifier correlating a request with all of its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID. Useful for tests that need stable ids.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Canonical hyphenated form, which is also the wire encoding.
        fmt::Display::fmt(&self.0, f)
    }
}

/// Typed frame header.
///
/// Wire encoding uses PascalCase field names; unknown fields are ignored on
/// decode and missing optional fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageHeader {
    pub message_type: MessageType,
    /// Handler name for requests; echoed on response frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub request_id: RequestId,
    /// Populated only by the line-delimited framing, which carries the
    /// serialized payload length for explicit framing. Ignored on decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

/// One frame: header plus opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Value,
}

impl Message {
    fn with_header(
        message_type: MessageType,
        method: Option<String>,
        request_id: RequestId,
        payload: Value,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_type,
                method,
                request_id,
                content_length: None,
            },
            payload,
        }
    }

    /// An outbound request carrying a freshly generated id.
    pub fn request(method: impl Into<String>, payload: Value) -> Self {
        Self::with_header(
            MessageType::Request,
            Some(method.into()),
            RequestId::generate(),
            payload,
        )
    }

    /// A terminal success response for `request_id`.
    pub fn success(request_id: RequestId, method: Option<String>, payload: Value) -> Self {
        Self::with_header(MessageType::SuccessResponse, method, request_id, payload)
    }

    /// A terminal error response for `request_id`.
    pub fn error(request_id: RequestId, method: Option<String>, payload: Value) -> Self {
        Self::with_header(MessageType::ErrorResponse, method, request_id, payload)
    }

    /// A non-terminal intermediate result for `request_id`.
    pub fn intermediate(request_id: RequestId, method: Option<String>, payload: Value) -> Self {
        Self::with_header(
            MessageType::IntermediateResultResponse,
            method,
            request_id,
            payload,
        )
    }

    /// A non-terminal progress notification for `request_id`.
    pub fn progress(request_id: RequestId, method: Option<String>, payload: Value) -> Self {
        Self::with_header(MessageType::ProgressResponse, method, request_id, payload)
    }

    /// A cancellation directive for an in-flight request.
    pub fn cancel(request_id: RequestId) -> Self {
        Self::with_header(MessageType::Cancel, None, request_id, Value::Null)
    }

    /// A connection teardown directive.
    pub fn close() -> Self {
        Self::with_header(MessageType::Close, None, RequestId::generate(), Value::Null)
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }
}
