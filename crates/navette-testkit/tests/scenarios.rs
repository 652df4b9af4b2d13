//! End-to-end scenarios with a real connection on both ends of the pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use navette_core::{
    handler, ConnectionState, Framing, HandlerRegistry, RequestError, RequestOptions,
};
use navette_testkit::connected_pair;
use serde_json::{json, Value};

#[tokio::test]
async fn handshake_completes_on_both_ends() {
    let (host, plugin) = connected_pair(
        Framing::JsonStream,
        HandlerRegistry::new(),
        HandlerRegistry::new(),
    )
    .await
    .unwrap();
    assert_eq!(host.state(), ConnectionState::Connected);
    assert_eq!(plugin.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unknown_method_faults_the_waiter_not_the_connection() {
    let (host, plugin) = connected_pair(
        Framing::JsonStream,
        HandlerRegistry::new(),
        HandlerRegistry::new(),
    )
    .await
    .unwrap();

    match host.send_request::<Value, Value>("Foo", &json!({})).await {
        Err(RequestError::Fault(fault)) => {
            assert_eq!(fault.code, "UnknownMethod");
            assert_eq!(fault.message, "Foo");
        }
        other => panic!("expected UnknownMethod fault, got {other:?}"),
    }
    assert_eq!(host.state(), ConnectionState::Connected);
    assert_eq!(plugin.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_outlives_its_timeout_when_the_peer_reports_progress() {
    let registry = HandlerRegistry::new().with(
        "Slow",
        handler(|_, responder| async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                let _ = responder.send_progress(&json!({}));
            }
            Ok(json!("done"))
        }),
    );
    let (host, _plugin) =
        connected_pair(Framing::JsonStream, HandlerRegistry::new(), registry)
            .await
            .unwrap();

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        keep_alive: true,
        ..Default::default()
    };
    let reply: Value = host
        .send_request_with("Slow", &json!({}), options)
        .await
        .unwrap();
    assert_eq!(reply, json!("done"));
}

#[tokio::test(start_paused = true)]
async fn without_keep_alive_the_request_times_out_and_the_handler_sees_cancel() {
    let observed = Arc::new(AtomicBool::new(false));
    let observed_by_handler = observed.clone();
    let registry = HandlerRegistry::new().with(
        "Hang",
        handler(move |_, responder| {
            let observed = observed_by_handler.clone();
            async move {
                responder.cancelled().await;
                observed.store(true, Ordering::SeqCst);
                Ok(json!("cancelled"))
            }
        }),
    );
    let (host, _plugin) =
        connected_pair(Framing::JsonStream, HandlerRegistry::new(), registry)
            .await
            .unwrap();

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        keep_alive: false,
        ..Default::default()
    };
    match host
        .send_request_with::<Value, Value>("Hang", &json!({}), options)
        .await
    {
        Err(RequestError::TimedOut) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }

    // The timeout sent a Cancel frame; give it a beat to reach the handler.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(observed.load(Ordering::SeqCst));
    // The handler's late reply was dropped quietly.
    assert_eq!(host.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn peer_close_resolves_outstanding_requests() {
    let (host, plugin) = connected_pair(
        Framing::JsonStream,
        HandlerRegistry::new(),
        // A handler that never answers while the connection lives.
        HandlerRegistry::new().with(
            "Hang",
            handler(|_, responder| async move {
                responder.cancelled().await;
                Ok(Value::Null)
            }),
        ),
    )
    .await
    .unwrap();

    let pending = {
        let host = host.clone();
        tokio::spawn(async move { host.send_request::<Value, Value>("Hang", &json!({})).await })
    };
    tokio::task::yield_now().await;

    plugin.close().await;
    host.wait_for_close().await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(RequestError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn close_message_asks_the_peer_to_tear_down() {
    let (host, plugin) = connected_pair(
        Framing::JsonStream,
        HandlerRegistry::new(),
        HandlerRegistry::new(),
    )
    .await
    .unwrap();

    host.send_close_message().unwrap();
    plugin.wait_for_close().await;
    assert_eq!(plugin.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn connect_fails_cleanly_when_the_peer_never_answers() {
    // Only one side connects; use a short handshake window.
    let options = navette_core::ConnectionOptions {
        handshake_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (host, _silent) = navette_testkit::endpoint_pair_with_options(
        options.clone(),
        HandlerRegistry::new(),
        options,
        HandlerRegistry::new(),
    );

    match host.connect().await {
        Err(navette_core::ConnectionError::HandshakeFailed(_)) => {}
        other => panic!("expected HandshakeFailed, got {other:?}"),
    }
    assert_eq!(host.state(), ConnectionState::Closed);
}
