//! Bidirectional RPC scenarios.
//!
//! Shared flows for patterns where both peers call each other, like a
//! plugin calling back into its host mid-request.

use std::sync::{Arc, OnceLock};

use navette_core::{handler, Connection, Framing, HandlerRegistry, RemoteFault};
use serde_json::{json, Value};

use crate::{connected_pair, TestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidirectionalScenario {
    /// Host calls plugin, plugin echoes back.
    SimpleEcho,
    /// Host calls plugin; the plugin calls back into the host while
    /// servicing the request.
    NestedCallback,
    /// Many interleaved requests on one connection.
    ConcurrentRequests,
}

/// Run one scenario over the given framing, panicking on failure.
pub async fn run_bidirectional_scenario(framing: Framing, scenario: BidirectionalScenario) {
    let result = match scenario {
        BidirectionalScenario::SimpleEcho => run_simple_echo(framing).await,
        BidirectionalScenario::NestedCallback => run_nested_callback(framing).await,
        BidirectionalScenario::ConcurrentRequests => run_concurrent_requests(framing).await,
    };
    if let Err(e) = result {
        panic!("bidirectional scenario {scenario:?} over {framing:?} failed: {e}");
    }
}

async fn run_simple_echo(framing: Framing) -> Result<(), TestError> {
    let plugin_registry =
        HandlerRegistry::new().with("Echo", handler(|payload, _| async move { Ok(payload) }));
    let (host, plugin) = connected_pair(framing, HandlerRegistry::new(), plugin_registry).await?;

    let reply: Value = host.send_request("Echo", &json!("hello")).await?;
    if reply != json!("hello") {
        return Err(TestError::Assertion(format!(
            "expected echo \"hello\", got {reply}"
        )));
    }

    host.close().await;
    plugin.wait_for_close().await;
    Ok(())
}

async fn run_nested_callback(framing: Framing) -> Result<(), TestError> {
    // The host provides a value lookup; the plugin's Format handler calls
    // back into the host while servicing the request.
    let host_registry = HandlerRegistry::new().with(
        "GetPrefix",
        handler(|_, _| async move { Ok(json!("PREFIX:")) }),
    );

    let slot: Arc<OnceLock<Connection>> = Arc::new(OnceLock::new());
    let handler_slot = slot.clone();
    let plugin_registry = HandlerRegistry::new().with(
        "Format",
        handler(move |payload, _| {
            let slot = handler_slot.clone();
            async move {
                let connection = slot
                    .get()
                    .cloned()
                    .ok_or_else(|| RemoteFault::handler_fault("plugin connection not ready"))?;
                let prefix: String = connection
                    .send_request("GetPrefix", &Value::Null)
                    .await
                    .map_err(|e| RemoteFault::handler_fault(e.to_string()))?;
                let input = payload.as_str().unwrap_or_default();
                Ok(json!(format!("{prefix}{input}")))
            }
        }),
    );

    let (host, plugin) = connected_pair(framing, host_registry, plugin_registry).await?;
    let _ = slot.set(plugin.clone());

    let reply: String = host.send_request("Format", &json!("test")).await?;
    if reply != "PREFIX:test" {
        return Err(TestError::Assertion(format!(
            "expected \"PREFIX:test\", got {reply:?}"
        )));
    }

    host.close().await;
    plugin.wait_for_close().await;
    Ok(())
}

async fn run_concurrent_requests(framing: Framing) -> Result<(), TestError> {
    let plugin_registry = HandlerRegistry::new().with(
        "Double",
        handler(|payload, _| async move {
            let n = payload.as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        }),
    );
    let (host, plugin) = connected_pair(framing, HandlerRegistry::new(), plugin_registry).await?;

    let mut tasks = Vec::new();
    for n in 0..16i64 {
        let host = host.clone();
        tasks.push(tokio::spawn(async move {
            host.send_request::<Value, i64>("Double", &json!(n)).await
        }));
    }
    for (n, task) in tasks.into_iter().enumerate() {
        let doubled = task
            .await
            .map_err(|e| TestError::Assertion(format!("task panicked: {e}")))??;
        if doubled != (n as i64) * 2 {
            return Err(TestError::Assertion(format!(
                "Double({n}) returned {doubled}"
            )));
        }
    }

    host.close().await;
    plugin.wait_for_close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simple_echo_json_stream() {
        run_bidirectional_scenario(Framing::JsonStream, BidirectionalScenario::SimpleEcho).await;
    }

    #[tokio::test]
    async fn simple_echo_line_delimited() {
        run_bidirectional_scenario(Framing::LineDelimited, BidirectionalScenario::SimpleEcho).await;
    }

    #[tokio::test]
    async fn nested_callback_json_stream() {
        run_bidirectional_scenario(Framing::JsonStream, BidirectionalScenario::NestedCallback)
            .await;
    }

    #[tokio::test]
    async fn nested_callback_line_delimited() {
        run_bidirectional_scenario(Framing::LineDelimited, BidirectionalScenario::NestedCallback)
            .await;
    }

    #[tokio::test]
    async fn concurrent_requests_json_stream() {
        run_bidirectional_scenario(Framing::JsonStream, BidirectionalScenario::ConcurrentRequests)
            .await;
    }
}
