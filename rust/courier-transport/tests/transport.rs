//! Integration tests for the broker-coupled transport, run against the
//! in-memory reference broker.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use courier_broker::mem::MemBroker;
use courier_broker::{BrokerError, Connection, Publishing};
use courier_transport::{Config, Transport, TransportError, DIRECT_REPLY_QUEUE};
use courier_wire::{headers, Headers, Request, Response, ENCODING_REQUEST, ENCODING_RESPONSE};

fn test_config() -> Config {
    Config {
        exchange: "courier".to_string(),
        connect_timeout: Duration::from_secs(5),
        handoff_timeout: Duration::from_millis(500),
        respond_timeout: Duration::from_secs(1),
    }
}

fn transport(broker: &MemBroker) -> Transport {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Transport::with_config(broker.clone(), test_config())
}

/// A request publishing the way a remote courier peer would stamp it.
fn request_publishing(id: &str, service: &str, endpoint: &str, body: &[u8]) -> Publishing {
    let mut hdrs = Headers::new();
    hdrs.insert(
        headers::CONTENT_ENCODING.to_string(),
        ENCODING_REQUEST.to_string(),
    );
    hdrs.insert(headers::SERVICE.to_string(), service.to_string());
    hdrs.insert(headers::ENDPOINT.to_string(), endpoint.to_string());
    Publishing {
        correlation_id: id.to_string(),
        timestamp: SystemTime::now(),
        body: body.to_vec(),
        reply_to: Some(DIRECT_REPLY_QUEUE.to_string()),
        headers: hdrs,
    }
}

fn response_publishing(id: &str, body: &[u8], encoding: &str) -> Publishing {
    let mut hdrs = Headers::new();
    hdrs.insert(headers::CONTENT_ENCODING.to_string(), encoding.to_string());
    Publishing {
        correlation_id: id.to_string(),
        timestamp: SystemTime::now(),
        body: body.to_vec(),
        reply_to: None,
        headers: hdrs,
    }
}

/// A peer service on its own broker session, echoing request bodies back to
/// each caller's reply address.
async fn spawn_echo_peer(broker: &MemBroker, service: &str) {
    let conn = broker.connect();
    let mut consumer = conn.consume(service).await.unwrap();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.deliveries.recv().await {
            let publishing = response_publishing(
                &delivery.correlation_id,
                &delivery.body,
                ENCODING_RESPONSE,
            );
            conn.publish("", &delivery.reply_to, publishing)
                .await
                .unwrap();
        }
    });
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn send_round_trips_through_the_broker() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    spawn_echo_peer(&broker, "ledger").await;

    let req = Request::new("ledger", "Balance", b"pong".to_vec());
    let rsp = t.send(req, Duration::from_secs(1)).await.unwrap();

    assert_eq!(rsp.payload, b"pong");
    assert!(!rsp.id.is_empty());
    assert_eq!(t.pending_calls(), 0);

    t.stop().await;
}

#[tokio::test]
async fn caller_provided_id_is_never_overwritten() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    spawn_echo_peer(&broker, "ledger").await;

    let mut req = Request::new("ledger", "Balance", b"x".to_vec());
    req.id = "retry-7".to_string();
    let rsp = t.send(req, Duration::from_secs(1)).await.unwrap();
    assert_eq!(rsp.id, "retry-7");
}

#[tokio::test]
async fn concurrent_sends_do_not_cross_talk() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    spawn_echo_peer(&broker, "ledger").await;

    let mut calls = Vec::new();
    for i in 0..8 {
        let t = t.clone();
        calls.push(tokio::spawn(async move {
            let body = format!("payload-{i}").into_bytes();
            let rsp = t
                .send(
                    Request::new("ledger", "Balance", body.clone()),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            assert_eq!(rsp.payload, body);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(t.pending_calls(), 0);
}

#[tokio::test]
async fn send_times_out_without_a_responder() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let req = Request::new("ledger", "Balance", Vec::new());
    let err = t.send(req, Duration::from_millis(50)).await.unwrap_err();

    assert_eq!(err, TransportError::Timeout);
    assert_eq!(t.pending_calls(), 0);
}

#[tokio::test]
async fn unmatched_response_is_dropped() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    t.readiness().fired().await;

    let peer = broker.connect();
    peer.publish(
        "",
        DIRECT_REPLY_QUEUE,
        response_publishing("nobody-waiting", b"orphan", ENCODING_RESPONSE),
    )
    .await
    .unwrap();

    // The transport keeps serving afterwards.
    spawn_echo_peer(&broker, "ledger").await;
    let rsp = t
        .send(
            Request::new("ledger", "Balance", b"still alive".to_vec()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(rsp.payload, b"still alive");
}

#[tokio::test]
async fn reply_consumer_ignores_wrong_content_encoding() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    t.readiness().fired().await;
    let peer = broker.connect();

    let mut req = Request::new("ledger", "Balance", Vec::new());
    req.id = "fixed".to_string();
    let pending = tokio::spawn({
        let t = t.clone();
        async move { t.send(req, Duration::from_millis(300)).await }
    });
    eventually(|| t.pending_calls() == 1).await;

    // Request-encoded delivery on the reply queue must not wake the caller.
    peer.publish(
        "",
        DIRECT_REPLY_QUEUE,
        response_publishing("fixed", b"not a response", ENCODING_REQUEST),
    )
    .await
    .unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, TransportError::Timeout);
}

#[tokio::test]
async fn second_listen_is_refused_without_disturbing_the_first() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let (tx1, mut rx1) = mpsc::channel(4);
    t.listen("ledger", tx1).await.unwrap();

    let (tx2, mut rx2) = mpsc::channel(4);
    let err = t.listen("ledger", tx2).await.unwrap_err();
    assert_eq!(err, TransportError::AlreadyListening);
    assert_eq!(t.listener_count(), 1);

    let peer = broker.connect();
    peer.publish(
        "courier",
        "ledger",
        request_publishing("r1", "ledger", "Balance", b"q"),
    )
    .await
    .unwrap();

    let got = timeout(Duration::from_secs(1), rx1.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, "r1");
    assert_eq!(got.service, "ledger");
    assert_eq!(got.endpoint, "Balance");
    assert_eq!(got.reply_to(), Some(DIRECT_REPLY_QUEUE));

    // The refused channel is untouched and still open.
    assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_err());
}

#[tokio::test]
async fn listener_drops_wrong_content_encoding() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let (tx, mut rx) = mpsc::channel(4);
    t.listen("ledger", tx).await.unwrap();

    let peer = broker.connect();
    let mut hdrs = Headers::new();
    hdrs.insert(headers::CONTENT_ENCODING.to_string(), "garbage".to_string());
    peer.publish(
        "courier",
        "ledger",
        Publishing {
            correlation_id: "bad-1".to_string(),
            timestamp: SystemTime::now(),
            body: b"q".to_vec(),
            reply_to: None,
            headers: hdrs,
        },
    )
    .await
    .unwrap();

    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn full_listener_channel_drops_requests_after_handoff_timeout() {
    let broker = MemBroker::new();
    let config = Config {
        handoff_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let t = Transport::with_config(broker.clone(), config);

    let (tx, mut rx) = mpsc::channel(1);
    t.listen("ledger", tx).await.unwrap();

    let peer = broker.connect();
    for i in 0..2 {
        peer.publish(
            "courier",
            "ledger",
            request_publishing(&format!("r{i}"), "ledger", "Balance", b"q"),
        )
        .await
        .unwrap();
    }

    // The slot holds one request; the other hand-off times out and drops.
    sleep(Duration::from_millis(250)).await;
    assert!(rx.recv().await.is_some());
    assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
}

#[tokio::test]
async fn listen_surfaces_consume_failure_and_deregisters() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    t.readiness().fired().await;

    broker.refuse_consumes(true);
    let (tx, _rx) = mpsc::channel(4);
    let err = t.listen("ledger", tx).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Broker(BrokerError::Consume { .. })
    ));
    eventually(|| t.listener_count() == 0).await;

    // The slot is free again once the broker recovers.
    broker.refuse_consumes(false);
    let (tx, _rx) = mpsc::channel(4);
    t.listen("ledger", tx).await.unwrap();
}

#[tokio::test]
async fn stop_listening_drains_one_listener() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let (tx, mut rx) = mpsc::channel(4);
    t.listen("ledger", tx).await.unwrap();

    assert!(t.stop_listening("ledger").await);
    assert!(rx.recv().await.is_none());
    assert_eq!(t.listener_count(), 0);
    assert!(!t.stop_listening("ledger").await);

    let (tx, _rx) = mpsc::channel(4);
    t.listen("ledger", tx).await.unwrap();
}

#[tokio::test]
async fn respond_requires_a_reply_to_address() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let req = Request::new("ledger", "Balance", Vec::new());
    let err = t
        .respond(&req, Response::new("rsp-1", Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::NoReplyTo);
}

#[tokio::test]
async fn request_response_through_listener_and_respond() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let (tx, mut rx) = mpsc::channel(16);
    t.listen("ledger", tx).await.unwrap();

    let server = {
        let t = t.clone();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.service, "ledger");
            assert_eq!(req.endpoint, "Balance");
            let rsp = Response::new(req.id.clone(), b"balance: 42".to_vec());
            t.respond(&req, rsp).await.unwrap();
        })
    };

    let rsp = t
        .send(
            Request::new("ledger", "Balance", b"q".to_vec()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(rsp.payload, b"balance: 42");
    server.await.unwrap();

    t.stop().await;
}

#[tokio::test]
async fn stop_closes_listener_channels_and_fails_later_callers() {
    let broker = MemBroker::new();
    let t = transport(&broker);

    let (tx, mut rx) = mpsc::channel(4);
    t.listen("ledger", tx).await.unwrap();
    assert_eq!(t.listener_count(), 1);

    t.stop().await;
    assert_eq!(t.listener_count(), 0);
    assert!(rx.recv().await.is_none());

    let err = t
        .send(Request::new("ledger", "Balance", Vec::new()), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Stopped);
    assert_eq!(t.pending_calls(), 0);
}

#[tokio::test]
async fn reconnects_after_session_loss() {
    let broker = MemBroker::new();
    let t = transport(&broker);
    t.readiness().fired().await;

    broker.drop_sessions();

    // The supervisor dials a fresh session; a round trip proves the new
    // reply consumer is live.
    sleep(Duration::from_millis(100)).await;
    spawn_echo_peer(&broker, "ledger").await;
    let rsp = t
        .send(
            Request::new("ledger", "Balance", b"after reconnect".to_vec()),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(rsp.payload, b"after reconnect");

    t.stop().await;
}

#[tokio::test]
async fn connect_timeout_is_terminal() {
    let broker = MemBroker::new();
    broker.hold_sessions(true);
    let config = Config {
        connect_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let t = Transport::with_config(broker.clone(), config);

    let err = t
        .send(Request::new("ledger", "Balance", Vec::new()), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::CouldNotConnect);
}

#[tokio::test]
async fn reply_queue_failure_is_terminal() {
    let broker = MemBroker::new();
    broker.refuse_declares(true);
    let t = transport(&broker);

    let err = t
        .send(Request::new("ledger", "Balance", Vec::new()), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Broker(BrokerError::DeclareQueue { .. })
    ));

    // Teardown still completes cleanly.
    t.stop().await;
}
