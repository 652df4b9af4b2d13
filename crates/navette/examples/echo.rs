//! Host/plugin echo demo over an in-process duplex pipe.
//!
//! The "plugin" registers an `Echo` method that streams a couple of
//! intermediate results before answering; the "host" calls it and prints
//! what comes back. The same code works unchanged over a spawned child's
//! stdio — see the `stdio_plugin` example for the child side.

use navette::prelude::*;
use serde_json::{json, Value};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(run());
}

async fn run() {
    let (host_stream, plugin_stream) = tokio::io::duplex(64 * 1024);

    // ---- plugin side ----
    let registry = HandlerRegistry::new().with(
        "Echo",
        handler(|payload, responder| async move {
            for step in 1..=2 {
                let _ = responder.send_intermediate(&json!({ "step": step }));
            }
            Ok(json!({ "echoed": payload }))
        }),
    );
    let (plugin_read, plugin_write) = tokio::io::split(plugin_stream);
    let plugin = Connection::new(
        plugin_read,
        plugin_write,
        registry,
        ConnectionOptions::default(),
    );

    // ---- host side ----
    let (host_read, host_write) = tokio::io::split(host_stream);
    let host = Connection::new(
        host_read,
        host_write,
        HandlerRegistry::new(),
        ConnectionOptions::default(),
    );

    let (a, b) = tokio::join!(host.connect(), plugin.connect());
    a.expect("host handshake");
    b.expect("plugin handshake");
    println!("handshake complete; host is {}", host.state());

    let (updates_tx, mut updates_rx) = tokio::sync::mpsc::unbounded_channel();
    let bonjour = json!("bonjour");
    let request = host.send_request_with_updates::<Value, Value>(
        "Echo",
        &bonjour,
        RequestOptions::default(),
        updates_tx,
    );
    let printer = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            println!("intermediate: {update}");
        }
    });

    match request.await {
        Ok(reply) => println!("reply: {reply}"),
        Err(e) => eprintln!("request failed: {e}"),
    }
    printer.await.unwrap();

    host.close().await;
    plugin.wait_for_close().await;
    println!("closed; host is {}", host.state());
}
