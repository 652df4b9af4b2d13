//! Protocol-level tests driving a `Connection` against a hand-rolled peer
//! that speaks raw frames over an in-memory duplex stream. This is the level
//! where wire behavior (cancel frames, orphan responses, late responses) is
//! observable.

use std::time::Duration;

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use navette_core::{
    encode_message, handler, CancelToken, Connection, ConnectionError, ConnectionOptions,
    ConnectionState, FaultEvent, FrameDecoder, Framing, HandlerRegistry, HandshakeRequest,
    Message, MessageType, RequestError, RequestId, RequestOptions, HANDSHAKE_METHOD,
};

/// A scripted peer endpoint: reads and writes raw frames directly.
struct WirePeer {
    framing: Framing,
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl WirePeer {
    fn new(stream: DuplexStream, framing: Framing) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            framing,
            reader,
            writer,
            decoder: FrameDecoder::new(framing),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, message: &Message) {
        let mut bytes = Vec::new();
        encode_message(self.framing, message, &mut bytes).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        loop {
            if let Some(message) = self.decoder.decode(&mut self.buf).unwrap() {
                return message;
            }
            let n = self.reader.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "stream ended while a frame was expected");
        }
    }

    /// Drain frames until the connection's writer shuts down.
    async fn recv_until_eof(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            while let Some(message) = self.decoder.decode(&mut self.buf).unwrap() {
                messages.push(message);
            }
            if self.reader.read_buf(&mut self.buf).await.unwrap() == 0 {
                return messages;
            }
        }
    }

    /// Run the peer's half of the symmetric handshake.
    async fn complete_handshake(&mut self) {
        let request = Message::request(
            HANDSHAKE_METHOD,
            serde_json::to_value(HandshakeRequest::default()).unwrap(),
        );
        self.send(&request).await;

        let mut serviced = false;
        let mut answered = false;
        while !(serviced && answered) {
            let message = self.recv().await;
            match message.message_type() {
                MessageType::Request
                    if message.header.method.as_deref() == Some(HANDSHAKE_METHOD) =>
                {
                    // Reply with an empty object; the connection accepts it
                    // via payload defaults.
                    let reply = Message::success(
                        message.request_id(),
                        Some(HANDSHAKE_METHOD.into()),
                        json!({}),
                    );
                    self.send(&reply).await;
                    serviced = true;
                }
                MessageType::SuccessResponse => answered = true,
                other => panic!("unexpected frame during handshake: {other:?}"),
            }
        }
    }
}

fn echo_registry() -> HandlerRegistry {
    HandlerRegistry::new().with("Echo", handler(|payload, _| async move { Ok(payload) }))
}

async fn connected(framing: Framing, registry: HandlerRegistry) -> (Connection, WirePeer) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(near);
    let options = ConnectionOptions {
        framing,
        ..Default::default()
    };
    let connection = Connection::new(read, write, registry, options);
    let mut peer = WirePeer::new(far, framing);
    let (connect, ()) = tokio::join!(connection.connect(), peer.complete_handshake());
    connect.unwrap();
    (connection, peer)
}

#[tokio::test]
async fn handshake_happy_path_reaches_connected() {
    let (connection, _peer) = connected(Framing::JsonStream, echo_registry()).await;
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn inbound_unknown_method_gets_error_response() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    peer.send(&Message::request("Foo", json!({}))).await;
    let reply = peer.recv().await;
    assert_eq!(reply.message_type(), MessageType::ErrorResponse);
    assert_eq!(reply.payload["Code"], "UnknownMethod");
    assert_eq!(reply.payload["Message"], "Foo");

    // The connection survives the unknown method.
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn outbound_request_resolves_with_peer_fault() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request::<Value, Value>("Foo", &json!({}))
                .await
        })
    };

    let request = peer.recv().await;
    assert_eq!(request.header.method.as_deref(), Some("Foo"));
    peer.send(&Message::error(
        request.request_id(),
        request.header.method.clone(),
        json!({"Code": "UnknownMethod", "Message": "Foo"}),
    ))
    .await;

    match task.await.unwrap() {
        Err(RequestError::Fault(fault)) => {
            assert_eq!(fault.code, "UnknownMethod");
            assert_eq!(fault.message, "Foo");
        }
        other => panic!("expected a remote fault, got {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_keep_alive_sends_one_cancel_and_drops_late_response() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;
    let mut faults = connection.faults();

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        keep_alive: false,
        ..Default::default()
    };
    let task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with::<Value, Value>("Slow", &json!({}), options)
                .await
        })
    };

    let request = peer.recv().await;
    // Never answer; the local timer fires at ~100 ms.
    assert!(matches!(task.await.unwrap(), Err(RequestError::TimedOut)));

    let cancel = peer.recv().await;
    assert_eq!(cancel.message_type(), MessageType::Cancel);
    assert_eq!(cancel.request_id(), request.request_id());

    // A late success is dropped quietly, not reported as an orphan.
    peer.send(&Message::success(
        request.request_id(),
        Some("Slow".into()),
        json!("too late"),
    ))
    .await;

    // Round-trip through the echo handler as a synchronization point.
    peer.send(&Message::request("Echo", json!("sync"))).await;
    let echoed = peer.recv().await;
    assert_eq!(echoed.message_type(), MessageType::SuccessResponse);

    assert!(matches!(
        faults.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_progress_defers_the_timeout() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(100)),
        keep_alive: true,
        ..Default::default()
    };
    let task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with::<Value, Value>("Slow", &json!({}), options)
                .await
        })
    };

    let request = peer.recv().await;
    let id = request.request_id();
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        peer.send(&Message::progress(id, Some("Slow".into()), json!({})))
            .await;
    }
    peer.send(&Message::success(id, Some("Slow".into()), json!("done")))
        .await;

    assert_eq!(task.await.unwrap().unwrap(), json!("done"));

    // No Cancel frame was ever emitted: after closing, the peer sees only
    // end of stream.
    connection.close().await;
    let tail = peer.recv_until_eof().await;
    assert!(tail
        .iter()
        .all(|m| m.message_type() != MessageType::Cancel));
}

#[tokio::test]
async fn orphan_response_is_reported_and_survived() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;
    let mut faults = connection.faults();

    let ghost = RequestId::generate();
    peer.send(&Message::success(ghost, None, json!({}))).await;

    match faults.recv().await.unwrap() {
        FaultEvent::OrphanResponse { request_id } => assert_eq!(request_id, ghost),
        other => panic!("expected OrphanResponse, got {other}"),
    }
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn graceful_close_cancels_outstanding_requests() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let first = {
        let connection = connection.clone();
        tokio::spawn(
            async move { connection.send_request::<Value, Value>("A", &json!(1)).await },
        )
    };
    let second = {
        let connection = connection.clone();
        tokio::spawn(
            async move { connection.send_request::<Value, Value>("B", &json!(2)).await },
        )
    };
    // Both requests reach the wire before the close.
    peer.recv().await;
    peer.recv().await;

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        first.await.unwrap(),
        Err(RequestError::ConnectionClosed)
    ));
    assert!(matches!(
        second.await.unwrap(),
        Err(RequestError::ConnectionClosed)
    ));

    // Requests after close are refused.
    assert!(matches!(
        connection.send_request::<Value, Value>("C", &json!(3)).await,
        Err(RequestError::Send(ConnectionError::NotConnected))
    ));

    // Closing again is a no-op that returns immediately.
    connection.close().await;
}

#[tokio::test]
async fn close_frame_from_peer_tears_down() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let pending = {
        let connection = connection.clone();
        tokio::spawn(
            async move { connection.send_request::<Value, Value>("A", &json!(1)).await },
        )
    };
    peer.recv().await;

    peer.send(&Message::close()).await;
    connection.wait_for_close().await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(RequestError::ConnectionClosed)
    ));
    assert!(matches!(
        connection.send_request::<Value, Value>("B", &json!(2)).await,
        Err(RequestError::Send(ConnectionError::NotConnected))
    ));
}

#[tokio::test]
async fn codec_fault_closes_the_connection() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;
    let mut faults = connection.faults();

    peer.writer.write_all(b"this is not json\n").await.unwrap();
    peer.writer.flush().await.unwrap();

    match faults.recv().await.unwrap() {
        FaultEvent::Codec { .. } => {}
        other => panic!("expected codec fault, got {other}"),
    }
    connection.wait_for_close().await;
}

#[tokio::test]
async fn caller_cancellation_sends_a_single_cancel_frame() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let cancel = CancelToken::new();
    let options = RequestOptions {
        cancel: cancel.clone(),
        ..Default::default()
    };
    let task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with::<Value, Value>("Slow", &json!({}), options)
                .await
        })
    };
    let request = peer.recv().await;

    // Two cancels are equivalent to one.
    cancel.cancel();
    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(RequestError::Cancelled)));

    let frame = peer.recv().await;
    assert_eq!(frame.message_type(), MessageType::Cancel);
    assert_eq!(frame.request_id(), request.request_id());

    connection.close().await;
    let tail = peer.recv_until_eof().await;
    assert!(tail
        .iter()
        .all(|m| m.message_type() != MessageType::Cancel));
}

#[tokio::test]
async fn intermediate_results_stream_to_the_caller() {
    let (connection, mut peer) = connected(Framing::JsonStream, echo_registry()).await;

    let (updates_tx, mut updates_rx) = tokio::sync::mpsc::unbounded_channel();
    let task = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_request_with_updates::<Value, Value>(
                    "Enumerate",
                    &json!({}),
                    RequestOptions::default(),
                    updates_tx,
                )
                .await
        })
    };

    let request = peer.recv().await;
    let id = request.request_id();
    peer.send(&Message::intermediate(id, Some("Enumerate".into()), json!(1)))
        .await;
    peer.send(&Message::intermediate(id, Some("Enumerate".into()), json!(2)))
        .await;
    peer.send(&Message::success(id, Some("Enumerate".into()), json!("done")))
        .await;

    assert_eq!(task.await.unwrap().unwrap(), json!("done"));
    assert_eq!(updates_rx.recv().await.unwrap(), json!(1));
    assert_eq!(updates_rx.recv().await.unwrap(), json!(2));
}

#[tokio::test]
async fn handler_panic_becomes_error_response() {
    let registry = HandlerRegistry::new().with(
        "Explode",
        handler(|payload, _| async move {
            if payload.is_object() {
                panic!("boom");
            }
            Ok(payload)
        }),
    );
    let (connection, mut peer) = connected(Framing::JsonStream, registry).await;

    peer.send(&Message::request("Explode", json!({}))).await;
    let reply = peer.recv().await;
    assert_eq!(reply.message_type(), MessageType::ErrorResponse);
    assert_eq!(reply.payload["Code"], "HandlerFault");
    assert_eq!(reply.payload["Message"], "boom");
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn cancel_frame_reaches_the_inbound_handler() {
    let registry = HandlerRegistry::new().with(
        "Watch",
        handler(|_payload, responder| async move {
            responder.cancelled().await;
            Ok(json!("observed-cancellation"))
        }),
    );
    let (_connection, mut peer) = connected(Framing::JsonStream, registry).await;

    let request = Message::request("Watch", json!({}));
    let id = request.request_id();
    peer.send(&request).await;
    peer.send(&Message::cancel(id)).await;
    // A duplicate cancel is a no-op.
    peer.send(&Message::cancel(id)).await;

    let reply = peer.recv().await;
    assert_eq!(reply.message_type(), MessageType::SuccessResponse);
    assert_eq!(reply.payload, json!("observed-cancellation"));
}

#[tokio::test]
async fn line_delimited_framing_speaks_the_same_protocol() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(near);
    let options = ConnectionOptions {
        framing: Framing::LineDelimited,
        ..Default::default()
    };
    let connection = Connection::new(read, write, echo_registry(), options);
    let mut peer = WirePeer::new(far, Framing::LineDelimited);

    let (connect, ()) = tokio::join!(connection.connect(), peer.complete_handshake());
    connect.unwrap();

    peer.send(&Message::request("Echo", json!({"k": "v"}))).await;
    let reply = peer.recv().await;
    assert_eq!(reply.message_type(), MessageType::SuccessResponse);
    assert_eq!(reply.payload, json!({"k": "v"}));
}

#[tokio::test]
async fn second_connect_fails() {
    let (connection, _peer) = connected(Framing::JsonStream, echo_registry()).await;
    assert!(matches!(
        connection.connect().await,
        Err(ConnectionError::AlreadyConnected)
    ));
}
