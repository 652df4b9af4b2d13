//! Mandatory handshake exchanged before any application traffic.
//!
//! Both endpoints send a `Handshake` request and service the peer's. Each
//! direction carries the local protocol version window and the method names
//! the endpoint can service; the built-in handler negotiates the highest
//! mutually acceptable version and trips the remote-handshake latch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RemoteFault;
use crate::handler::{handler, HandlerFn};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest protocol version this crate accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
/// Reserved method name; registrations under it are overridden by the
/// built-in handler.
pub const HANDSHAKE_METHOD: &str = "Handshake";

/// Payload of the `Handshake` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    /// Methods this endpoint can service.
    pub methods: Vec<String>,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            methods: Vec::new(),
        }
    }
}

/// Payload of the success response to a `Handshake` request.
///
/// Every field has a default, so a peer replying with an empty object is
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HandshakeResponse {
    /// Version the responder selected for this connection.
    pub protocol_version: u32,
}

impl Default for HandshakeResponse {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Pick the highest version acceptable to both windows.
pub(crate) fn negotiate(
    local: &HandshakeRequest,
    remote: &HandshakeRequest,
) -> Result<u32, RemoteFault> {
    let version = local.protocol_version.min(remote.protocol_version);
    if version < local.min_protocol_version || version < remote.min_protocol_version {
        return Err(RemoteFault::handshake_failed(format!(
            "no mutually acceptable protocol version (local {}..={}, remote {}..={})",
            local.min_protocol_version,
            local.protocol_version,
            remote.min_protocol_version,
            remote.protocol_version,
        )));
    }
    Ok(version)
}

/// The built-in `Handshake` handler.
///
/// Validates the peer's request, signals `latch` so the local `connect` can
/// observe that the remote handshake has been serviced, and replies with the
/// negotiated version.
pub(crate) fn built_in_handler(
    local: HandshakeRequest,
    latch: Arc<watch::Sender<bool>>,
) -> HandlerFn {
    handler(move |payload, _responder| {
        let local = local.clone();
        let latch = latch.clone();
        async move {
            let remote: HandshakeRequest = serde_json::from_value(payload).map_err(|e| {
                RemoteFault::handshake_failed(format!("invalid handshake payload: {e}"))
            })?;
            let version = negotiate(&local, &remote)?;
            tracing::debug!(
                version,
                remote_methods = remote.methods.len(),
                "remote handshake serviced"
            );
            let _ = latch.send(true);
            serde_json::to_value(HandshakeResponse {
                protocol_version: version,
            })
            .map_err(|e| RemoteFault::handler_fault(e.to_string()))
        }
    })
}
