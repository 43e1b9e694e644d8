//! Integration tests for the transport session against an in-process
//! WebSocket broker.
//!
//! The broker here is intentionally tiny: it speaks just enough of the wire
//! protocol (ConnAck, SubAck, Delivery) to exercise connection,
//! interruption, resume, and resubscription end to end over real sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use scout_bridge::protocol::{ConnAck, Delivery, SubAck};
use scout_bridge::{
    DeliveryGuarantee, SessionEvent, Transport, TransportConfig, WireMessage,
};

/// What the broker observed, per connection.
#[derive(Debug, Default)]
struct BrokerLog {
    /// Subscribed topics, one Vec per accepted connection.
    subscriptions: Vec<Vec<String>>,
    /// Published (topic, payload) pairs across all connections.
    publishes: Vec<(String, serde_json::Value)>,
}

fn frame(message: &WireMessage) -> Message {
    Message::Text(message.to_json().unwrap().into())
}

/// Client config tuned for fast test reconnects.
fn test_config(addr: std::net::SocketAddr) -> TransportConfig {
    TransportConfig {
        url: format!("ws://{addr}"),
        connect_timeout: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        ping_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Accepts two connections in sequence.
///
/// Connection 1: acks the session, grants one subscription, then drops the
/// connection. Connection 2: acks with `session_present = false`, grants
/// resubscriptions, sends one delivery, then serves until the client closes.
async fn run_broker(listener: TcpListener, log: Arc<Mutex<BrokerLog>>) {
    // ---- Connection 1 ----
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    log.lock().await.subscriptions.push(Vec::new());

    ws.send(frame(&WireMessage::ConnAck(ConnAck {
        session_present: false,
    })))
    .await
    .unwrap();

    // Grant exactly one subscription, then hang up.
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            if let Ok(WireMessage::Subscribe(sub)) = WireMessage::from_json(&text) {
                log.lock().await.subscriptions[0].push(sub.topic.clone());
                ws.send(frame(&WireMessage::SubAck(SubAck {
                    topic: sub.topic,
                    granted: true,
                })))
                .await
                .unwrap();
                break;
            }
        }
    }
    drop(ws);

    // ---- Connection 2 ----
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    log.lock().await.subscriptions.push(Vec::new());

    ws.send(frame(&WireMessage::ConnAck(ConnAck {
        session_present: false,
    })))
    .await
    .unwrap();

    let mut sent_delivery = false;
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(text) => match WireMessage::from_json(&text) {
                Ok(WireMessage::Subscribe(sub)) => {
                    log.lock().await.subscriptions[1].push(sub.topic.clone());
                    ws.send(frame(&WireMessage::SubAck(SubAck {
                        topic: sub.topic.clone(),
                        granted: true,
                    })))
                    .await
                    .unwrap();

                    if !sent_delivery {
                        sent_delivery = true;
                        ws.send(frame(&WireMessage::Delivery(Delivery {
                            topic: sub.topic,
                            payload: json!({ "hello": "again" }),
                        })))
                        .await
                        .unwrap();
                    }
                }
                Ok(WireMessage::Publish(publish)) => {
                    log.lock()
                        .await
                        .publishes
                        .push((publish.topic, publish.payload));
                }
                Ok(WireMessage::Ping { timestamp }) => {
                    ws.send(frame(&WireMessage::Pong { timestamp })).await.unwrap();
                }
                _ => {}
            },
            Message::Close(_) => break,
            Message::Ping(data) => {
                ws.send(Message::Pong(data)).await.unwrap();
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn session_resumes_and_resubscribes_after_interruption() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(BrokerLog::default()));
    let broker = tokio::spawn(run_broker(listener, log.clone()));

    let (handle, mut events) = Transport::spawn(test_config(addr));

    // Subscribe over connection 1. The grant proves the SubAck arrived.
    let grant = tokio::time::timeout(
        Duration::from_secs(5),
        handle.subscribe("alpha", DeliveryGuarantee::AtLeastOnce),
    )
    .await
    .expect("subscribe must not hang")
    .expect("subscription must be granted");
    assert_eq!(grant.topic(), "alpha");

    // The broker hangs up; the session must report the interruption and
    // then the (non-persisted) resume.
    let mut interrupted = false;
    let resumed = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("expected a session event")
            .expect("session event channel closed")
        {
            SessionEvent::Interrupted { .. } => interrupted = true,
            SessionEvent::Resumed { session_present } => break session_present,
            SessionEvent::ResubscribeFailed { topic } => {
                panic!("unexpected resubscribe failure on {topic}")
            }
            SessionEvent::Delivery { .. } => {}
        }
    };
    assert!(interrupted, "interruption must be reported before the resume");
    assert!(!resumed, "mock broker never persists sessions");

    // The resubscription happens inside the transport; the broker then
    // pushes one delivery on the re-granted topic.
    let delivery = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("expected a delivery")
            .expect("session event channel closed")
        {
            SessionEvent::Delivery { topic, payload } => break (topic, payload),
            _ => {}
        }
    };
    assert_eq!(delivery.0, "alpha");
    assert_eq!(delivery.1, json!({ "hello": "again" }));

    // Publishes flow again over the resumed connection.
    handle
        .publish("dt/test/scanner-1", json!({ "seq": 1 }), DeliveryGuarantee::AtLeastOnce)
        .await
        .unwrap();

    // Give the broker a moment to record the publish, then shut down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), broker).await;

    let log = log.lock().await;
    assert_eq!(log.subscriptions[0], vec!["alpha".to_string()]);
    // Exactly one resubscription for the one granted topic, no duplicates.
    assert_eq!(log.subscriptions[1], vec!["alpha".to_string()]);
    assert_eq!(log.publishes.len(), 1);
    assert_eq!(log.publishes[0].0, "dt/test/scanner-1");
    assert_eq!(log.publishes[0].1, json!({ "seq": 1 }));
}

#[tokio::test]
async fn subscribe_rejection_surfaces_as_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(frame(&WireMessage::ConnAck(ConnAck {
            session_present: false,
        })))
        .await
        .unwrap();

        while let Some(Ok(Message::Text(text))) = ws.next().await {
            if let Ok(WireMessage::Subscribe(sub)) = WireMessage::from_json(&text) {
                ws.send(frame(&WireMessage::SubAck(SubAck {
                    topic: sub.topic,
                    granted: false,
                })))
                .await
                .unwrap();
            }
        }
    });

    let (handle, _events) = Transport::spawn(test_config(addr));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        handle.subscribe("forbidden", DeliveryGuarantee::AtLeastOnce),
    )
    .await
    .expect("subscribe must resolve");

    assert!(result.is_err(), "a rejected subscription must be an error");
    handle.shutdown().await.unwrap();
}
