//! navette-core: the connection engine for bidirectional RPC over a duplex
//! byte stream.
//!
//! This crate defines:
//! - Wire messages ([`Message`], [`MessageHeader`], [`MessageType`], [`RequestId`])
//! - The frame codec ([`Framing`], [`FrameDecoder`], [`encode_message`])
//! - The connection orchestrator ([`Connection`], [`ConnectionOptions`], [`ConnectionState`])
//! - Handler plumbing ([`HandlerRegistry`], [`handler`], [`Responder`])
//! - Request options and cancellation ([`RequestOptions`], [`CancelToken`])
//! - The handshake payloads ([`HandshakeRequest`], [`HandshakeResponse`])
//! - The error taxonomy ([`CodecError`], [`ConnectionError`], [`RequestError`], [`RemoteFault`], [`FaultEvent`])
//!
//! The canonical embedding wires a [`Connection`] to the stdio of a spawned
//! plugin process; any `AsyncRead`/`AsyncWrite` pair works. The `navette`
//! facade crate adds the stdio helpers and examples.

pub mod cancel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod requests;

mod event;
mod receiver;
mod sender;

pub use cancel::CancelToken;
pub use codec::{encode_message, FrameDecoder, Framing};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use error::{CodecError, ConnectionError, FaultEvent, RemoteFault, RequestError};
pub use handler::{handler, HandlerFn, HandlerFuture, HandlerRegistry, Responder};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, HANDSHAKE_METHOD, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use message::{Message, MessageHeader, MessageType, RequestId};
pub use requests::RequestOptions;
