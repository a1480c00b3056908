//! End-to-end socket and channel tests against an in-process server.
//!
//! Covers the connection lifecycle, the channel join state machine, buffered
//! sends, reply correlation, heartbeats, and automatic recovery.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_client::{ChannelState, Socket, SocketConfig, SocketState};
use beacon_protocol::Envelope;
use serde_json::{json, Value};

use common::MockServer;

/// Fast timers, heartbeat off unless a test turns it on.
fn test_config() -> SocketConfig {
    SocketConfig {
        heartbeat_interval: Duration::ZERO,
        reconnect_after: Arc::new(|_| Duration::from_millis(50)),
        rejoin_after: Arc::new(|_| Duration::from_millis(50)),
        timeout: Duration::from_millis(500),
        ..SocketConfig::default()
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn join_succeeds_and_transitions_to_joined() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:lobby", json!({"name": "sam"}));
    let joined = Arc::new(AtomicBool::new(false));
    {
        let joined = joined.clone();
        channel
            .join(None)
            .expect("first join")
            .receive("ok", move |_| joined.store(true, Ordering::SeqCst));
    }

    wait_for("join ok", || joined.load(Ordering::SeqCst)).await;
    assert_eq!(channel.state(), ChannelState::Joined);
    assert!(socket.is_connected());

    // The join carried the params and its own ref as the join_ref
    let joins = server.received_for("room:lobby");
    assert_eq!(joins[0].event, "phx_join");
    assert_eq!(joins[0].payload, json!({"name": "sam"}));
    assert_eq!(joins[0].join_ref, channel.join_ref());
}

#[tokio::test]
async fn pushes_buffer_until_join_completes_and_flush_in_order() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    // The server acknowledges this join only after a delay
    let channel = socket.channel("slow:room", json!({}));
    channel.join(None).expect("first join");

    let first = channel.push("new_msg", json!({"n": 1})).expect("push");
    let second = channel.push("new_msg", json!({"n": 2})).expect("push");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = server.received_for("slow:room");
    assert_eq!(seen.len(), 1, "only the join may be on the wire yet");
    assert_eq!(seen[0].event, "phx_join");
    assert!(first.msg_ref().is_none(), "buffered push has no ref yet");

    wait_for("buffered pushes flushed", || {
        server.received_for("slow:room").len() == 3
    })
    .await;
    assert_eq!(channel.state(), ChannelState::Joined);

    let seen = server.received_for("slow:room");
    assert_eq!(seen[1].payload, json!({"n": 1}));
    assert_eq!(seen[2].payload, json!({"n": 2}));
    assert!(first.msg_ref().is_some());
    assert!(second.msg_ref().is_some());

    // Both flushed pushes are acknowledged
    wait_for("push replies", || {
        first.has_received("ok") && second.has_received("ok")
    })
    .await;
}

#[tokio::test]
async fn rejected_join_errors_the_channel() {
    let server = MockServer::start().await;
    // Slow rejoin so the errored state is observable
    let config = SocketConfig {
        rejoin_after: Arc::new(|_| Duration::from_secs(10)),
        ..test_config()
    };
    let socket = Socket::new(server.url(), config);
    socket.connect();

    let channel = socket.channel("reject:room", json!({}));
    let reason: Arc<Mutex<Option<Value>>> = Arc::default();
    {
        let reason = reason.clone();
        channel
            .join(None)
            .expect("first join")
            .receive("error", move |response| {
                *reason.lock().unwrap() = Some(response.clone());
            });
    }

    wait_for("join rejected", || reason.lock().unwrap().is_some()).await;
    assert_eq!(channel.state(), ChannelState::Errored);
    assert_eq!(
        reason.lock().unwrap().clone(),
        Some(json!({"reason": "rejected"}))
    );
}

#[tokio::test]
async fn unanswered_join_times_out() {
    let server = MockServer::start().await;
    // Slow rejoin so the errored state is observable
    let config = SocketConfig {
        rejoin_after: Arc::new(|_| Duration::from_secs(10)),
        ..test_config()
    };
    let socket = Socket::new(server.url(), config);
    socket.connect();

    let channel = socket.channel("silent:room", json!({}));
    let timed_out = Arc::new(AtomicBool::new(false));
    {
        let timed_out = timed_out.clone();
        channel
            .join(Some(Duration::from_millis(200)))
            .expect("first join")
            .receive("timeout", move |_| timed_out.store(true, Ordering::SeqCst));
    }

    wait_for("join timeout", || timed_out.load(Ordering::SeqCst)).await;
    assert_eq!(channel.state(), ChannelState::Errored);
}

#[tokio::test]
async fn late_attached_hook_sees_the_reply() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:late", json!({}));
    channel.join(None).expect("first join");
    wait_for("joined", || channel.state() == ChannelState::Joined).await;

    let push = channel.push("echo", json!({"body": "hi"})).expect("push");
    wait_for("reply received", || push.has_received("ok")).await;

    // Attaching after the reply arrived still fires, synchronously
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    {
        let seen = seen.clone();
        push.receive("ok", move |response| {
            *seen.lock().unwrap() = Some(response.clone());
        });
    }
    assert_eq!(seen.lock().unwrap().clone(), Some(json!({"body": "hi"})));
}

#[tokio::test]
async fn inbound_events_dispatch_to_bindings_in_order() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:events", json!({}));
    channel.join(None).expect("first join");
    wait_for("joined", || channel.state() == ChannelState::Joined).await;

    let order: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let order = order.clone();
        channel.on("new_msg", move |payload, _| {
            order
                .lock()
                .unwrap()
                .push(format!("a:{}", payload["body"].as_str().unwrap_or("")));
        });
    }
    {
        let order = order.clone();
        channel.on("new_msg", move |payload, _| {
            order
                .lock()
                .unwrap()
                .push(format!("b:{}", payload["body"].as_str().unwrap_or("")));
        });
    }

    server.broadcast(&Envelope::new(
        None,
        None,
        "room:events",
        "new_msg",
        json!({"body": "x"}),
    ));

    wait_for("both bindings fired", || order.lock().unwrap().len() == 2).await;
    assert_eq!(*order.lock().unwrap(), vec!["a:x", "b:x"]);
}

#[tokio::test]
async fn frames_from_outdated_joins_are_dropped() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:stale", json!({}));
    channel.join(None).expect("first join");
    wait_for("joined", || channel.state() == ChannelState::Joined).await;
    let join_ref = channel.join_ref().expect("join ref");

    let bodies: Arc<Mutex<Vec<Value>>> = Arc::default();
    {
        let bodies = bodies.clone();
        channel.on("new_msg", move |payload, _| {
            bodies.lock().unwrap().push(payload.clone());
        });
    }

    // A frame from a superseded join must be dropped silently
    server.broadcast(&Envelope::new(
        Some("999".to_string()),
        None,
        "room:stale",
        "new_msg",
        json!({"from": "stale"}),
    ));
    // Frames with the current join_ref or none at all are delivered
    server.broadcast(&Envelope::new(
        Some(join_ref),
        None,
        "room:stale",
        "new_msg",
        json!({"from": "current"}),
    ));
    server.broadcast(&Envelope::new(
        None,
        None,
        "room:stale",
        "new_msg",
        json!({"from": "agnostic"}),
    ));

    wait_for("deliverable frames", || bodies.lock().unwrap().len() == 2).await;
    assert_eq!(
        *bodies.lock().unwrap(),
        vec![json!({"from": "current"}), json!({"from": "agnostic"})]
    );
}

#[tokio::test]
async fn transport_loss_errors_channels_and_reconnects_with_fresh_join() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:recover", json!({}));
    channel.join(None).expect("first join");
    wait_for("joined", || channel.state() == ChannelState::Joined).await;
    let first_join_ref = channel.join_ref().expect("join ref");

    server.kill_connections();
    wait_for("channel errored", || {
        channel.state() == ChannelState::Errored
    })
    .await;

    wait_for("reconnected", || server.accepted() >= 2).await;
    wait_for("rejoined", || channel.state() == ChannelState::Joined).await;

    let second_join_ref = channel.join_ref().expect("join ref");
    assert_ne!(first_join_ref, second_join_ref, "rejoin allocates a new ref");
    let joins: Vec<Envelope> = server
        .received_for("room:recover")
        .into_iter()
        .filter(|e| e.event == "phx_join")
        .collect();
    assert!(joins.len() >= 2);
}

#[tokio::test]
async fn unacknowledged_heartbeat_forces_a_reconnect() {
    let server = MockServer::start().await;
    server.set_heartbeat_replies(false);

    let config = SocketConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..test_config()
    };
    let socket = Socket::new(server.url(), config);
    socket.connect();

    wait_for("first connection", || server.accepted() >= 1).await;
    // Tick one: heartbeat sent. Tick two: still unacknowledged, so the
    // transport is force-closed and the reconnect path engages.
    wait_for("reconnect after dead heartbeat", || server.accepted() >= 2).await;

    let heartbeats = server.received_for("phoenix");
    assert!(!heartbeats.is_empty());
    assert_eq!(heartbeats[0].event, "heartbeat");
    assert_eq!(heartbeats[0].join_ref, None);
}

#[tokio::test]
async fn acknowledged_heartbeats_keep_the_connection() {
    let server = MockServer::start().await;
    let config = SocketConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..test_config()
    };
    let socket = Socket::new(server.url(), config);
    socket.connect();

    wait_for("connected", || socket.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.accepted(), 1);
    assert!(socket.is_connected());
}

#[tokio::test]
async fn leave_closes_the_channel_and_frees_the_topic() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();

    let channel = socket.channel("room:leave", json!({}));
    channel.join(None).expect("first join");
    wait_for("joined", || channel.state() == ChannelState::Joined).await;

    let closed = Arc::new(AtomicUsize::new(0));
    {
        let closed = closed.clone();
        channel.on_close(move |_, _| {
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let leave = channel.leave(None);
    wait_for("left", || channel.state() == ChannelState::Closed).await;
    assert!(leave.has_received("ok"));
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let leaves = server.received_for("room:leave");
    assert!(leaves.iter().any(|e| e.event == "phx_leave"));

    // The instance is terminal, but the topic is free for a fresh channel
    assert!(channel.join(None).is_err());
    let fresh = socket.channel("room:leave", json!({}));
    assert!(fresh.join(None).is_ok());
}

#[tokio::test]
async fn explicit_disconnect_suppresses_reconnection() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());
    socket.connect();
    wait_for("connected", || socket.is_connected()).await;

    socket.disconnect(None, None).await;
    assert_eq!(socket.connection_state(), SocketState::Closed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.accepted(), 1, "no reconnect after disconnect()");
    assert!(!socket.is_connected());
}

#[tokio::test]
async fn join_issued_while_connecting_is_delivered_after_open() {
    let server = MockServer::start().await;
    let socket = Socket::new(server.url(), test_config());

    // Join before connect: the frame waits in the send buffer
    let channel = socket.channel("room:early", json!({}));
    channel.join(None).expect("first join");
    assert!(!socket.is_connected());

    socket.connect();
    wait_for("joined", || channel.state() == ChannelState::Joined).await;
}
