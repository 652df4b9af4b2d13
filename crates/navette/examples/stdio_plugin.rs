//! The plugin side of the canonical embedding: serve RPC over this
//! process's own stdio until the host closes the connection.
//!
//! A host would spawn this binary with piped stdio and connect with
//! `navette::stdio::connect_child`. Logs go to stderr; stdout belongs to
//! the protocol.

use navette::prelude::*;
use serde_json::json;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(serve());
}

async fn serve() {
    let registry = HandlerRegistry::new()
        .with("Echo", handler(|payload, _| async move { Ok(payload) }))
        .with(
            "Reverse",
            handler(|payload, _| async move {
                let text = payload.as_str().unwrap_or_default();
                Ok(json!(text.chars().rev().collect::<String>()))
            }),
        );

    let connection = navette::stdio::current(registry, ConnectionOptions::default());
    if let Err(e) = connection.connect().await {
        tracing::error!(error = %e, "handshake with host failed");
        return;
    }
    tracing::info!("plugin connected; serving until the host closes");
    connection.wait_for_close().await;
    tracing::info!("host closed the connection");
}
