//! navette-testkit: shared harness for connection-level tests.
//!
//! Provides connected in-memory endpoint pairs and reusable bidirectional
//! RPC scenarios, so integration tests across the workspace exercise the
//! same flows instead of each rebuilding its own plumbing.

use std::fmt;

use navette_core::{
    Connection, ConnectionError, ConnectionOptions, Framing, HandlerRegistry, RequestError,
};

pub mod bidirectional;

/// Test harness failure.
#[derive(Debug)]
pub enum TestError {
    Connect(ConnectionError),
    Request(RequestError),
    Assertion(String),
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Request(e) => write!(f, "request failed: {e}"),
            Self::Assertion(detail) => write!(f, "assertion failed: {detail}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ConnectionError> for TestError {
    fn from(e: ConnectionError) -> Self {
        Self::Connect(e)
    }
}

impl From<RequestError> for TestError {
    fn from(e: RequestError) -> Self {
        Self::Request(e)
    }
}

/// Two endpoints joined by an in-memory duplex stream, not yet connected.
pub fn endpoint_pair(
    framing: Framing,
    left: HandlerRegistry,
    right: HandlerRegistry,
) -> (Connection, Connection) {
    let options = ConnectionOptions {
        framing,
        ..Default::default()
    };
    endpoint_pair_with_options(options.clone(), left, options, right)
}

/// Like [`endpoint_pair`], with distinct per-endpoint options.
pub fn endpoint_pair_with_options(
    left_options: ConnectionOptions,
    left: HandlerRegistry,
    right_options: ConnectionOptions,
    right: HandlerRegistry,
) -> (Connection, Connection) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    (
        Connection::new(near_read, near_write, left, left_options),
        Connection::new(far_read, far_write, right, right_options),
    )
}

/// Build a pair and run both handshakes to completion.
pub async fn connected_pair(
    framing: Framing,
    left: HandlerRegistry,
    right: HandlerRegistry,
) -> Result<(Connection, Connection), TestError> {
    let (a, b) = endpoint_pair(framing, left, right);
    let (ra, rb) = tokio::join!(a.connect(), b.connect());
    ra?;
    rb?;
    Ok((a, b))
}
