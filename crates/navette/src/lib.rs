//! navette: bidirectional RPC between two peers over a duplex byte stream.
//!
//! Both endpoints of a connection can send requests, stream progress and
//! intermediate results, cancel in-flight work, and close gracefully — all
//! multiplexed over a single reader/writer pair. The canonical embedding
//! wires the pair to the stdio of a spawned plugin process.
//!
//! # Quick start
//!
//! ```ignore
//! use navette::prelude::*;
//!
//! // Host side: spawn the plugin and connect over its stdio.
//! let mut child = tokio::process::Command::new("my-plugin")
//!     .stdin(std::process::Stdio::piped())
//!     .stdout(std::process::Stdio::piped())
//!     .spawn()?;
//! let registry = HandlerRegistry::new()
//!     .with("Log", handler(|payload, _| async move { Ok(payload) }));
//! let connection = navette::stdio::connect_child(&mut child, registry, Default::default())?;
//! connection.connect().await?;
//!
//! let reply: serde_json::Value = connection.send_request("Echo", &"hello").await?;
//! connection.close().await;
//! ```
//!
//! Plugin side, the mirror image over its own stdio:
//!
//! ```ignore
//! let registry = HandlerRegistry::new()
//!     .with("Echo", handler(|payload, _| async move { Ok(payload) }));
//! let connection = navette::stdio::current(registry, Default::default());
//! connection.connect().await?;
//! connection.wait_for_close().await;
//! ```
//!
//! # Handlers
//!
//! Handlers receive the raw JSON payload plus a [`Responder`] capability for
//! emitting non-terminal responses (intermediate results and progress) and
//! observing cancellation. Registration is fixed at construction; the
//! `Handshake` method is reserved for the built-in implementation.
//!
//! # Requests
//!
//! [`Connection::send_request_with`] takes [`RequestOptions`]: an optional
//! timeout, a keep-alive flag (peer progress resets the timer), and a
//! [`CancelToken`] linked to the caller. Cancellation — by the caller, the
//! timer, or connection close — resolves the waiter exactly once and sends a
//! single `Cancel` frame to the peer.

// Re-export the engine.
pub use navette_core::{
    encode_message, handler, CancelToken, CodecError, Connection, ConnectionError,
    ConnectionOptions, ConnectionState, FaultEvent, FrameDecoder, Framing, HandlerFn,
    HandlerFuture, HandlerRegistry, HandshakeRequest, HandshakeResponse, Message, MessageHeader,
    MessageType, RemoteFault, RequestError, RequestId, RequestOptions, Responder,
    HANDSHAKE_METHOD, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// Convenient imports for embedders.
///
/// ```ignore
/// use navette::prelude::*;
/// ```
pub mod prelude {
    pub use navette_core::{
        handler, CancelToken, Connection, ConnectionOptions, ConnectionState, HandlerRegistry,
        RemoteFault, RequestError, RequestOptions, Responder,
    };
}

/// Stdio embeddings: the host side over a spawned child's pipes, and the
/// plugin side over the current process's own stdio.
pub mod stdio {
    use std::io;

    use tokio::process::{Child, ChildStdin, ChildStdout};

    use crate::{Connection, ConnectionOptions, HandlerRegistry};

    /// Take the piped stdio halves out of a spawned child.
    ///
    /// The child must have been spawned with `Stdio::piped()` for both
    /// stdin and stdout. Process lifetime stays with the caller; the
    /// connection only owns the streams.
    pub fn take_child_streams(child: &mut Child) -> io::Result<(ChildStdout, ChildStdin)> {
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "child stdout is not piped")
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "child stdin is not piped")
        })?;
        Ok((stdout, stdin))
    }

    /// Build a connection over a spawned child's stdio. Call
    /// [`Connection::connect`] to perform the handshake.
    pub fn connect_child(
        child: &mut Child,
        handlers: HandlerRegistry,
        options: ConnectionOptions,
    ) -> io::Result<Connection> {
        let (stdout, stdin) = take_child_streams(child)?;
        tracing::debug!("connection bound to child process stdio");
        Ok(Connection::new(stdout, stdin, handlers, options))
    }

    /// Build a connection over this process's own stdio — the plugin side of
    /// the canonical embedding. Nothing else may read stdin or write stdout
    /// for the lifetime of the connection.
    pub fn current(handlers: HandlerRegistry, options: ConnectionOptions) -> Connection {
        Connection::new(tokio::io::stdin(), tokio::io::stdout(), handlers, options)
    }
}
