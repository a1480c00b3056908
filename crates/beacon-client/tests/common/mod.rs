//! In-process websocket server speaking the envelope protocol, used to
//! exercise the client against scripted server behavior.
//!
//! Join handling is keyed off the topic: `reject:*` topics are refused,
//! `silent:*` topics never get a reply, `slow:*` topics are acknowledged
//! after a delay, everything else is acknowledged immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_protocol::{
    ControlEvent, Envelope, JsonSerializer, RawMessage, Serializer, HEARTBEAT_TOPIC,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

struct ServerState {
    reply_to_heartbeat: AtomicBool,
    accepted: AtomicUsize,
    received: Mutex<Vec<Envelope>>,
    writers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    kills: Mutex<Vec<Arc<Notify>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            reply_to_heartbeat: AtomicBool::new(true),
            accepted: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_conn(stream, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Total connections accepted since start (never decremented).
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_for(&self, topic: &str) -> Vec<Envelope> {
        self.received()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    pub fn set_heartbeat_replies(&self, enabled: bool) {
        self.state
            .reply_to_heartbeat
            .store(enabled, Ordering::SeqCst);
    }

    /// Abruptly drop every open connection.
    pub fn kill_connections(&self) {
        for kill in self.state.kills.lock().unwrap().drain(..) {
            kill.notify_waiters();
        }
        self.state.writers.lock().unwrap().clear();
    }

    /// Send a server-initiated envelope to every open connection.
    pub fn broadcast(&self, envelope: &Envelope) {
        let msg = encode_msg(envelope);
        for writer in self.state.writers.lock().unwrap().iter() {
            let _ = writer.send(msg.clone());
        }
    }
}

fn encode_msg(envelope: &Envelope) -> Message {
    let raw = JsonSerializer.encode(envelope).expect("encode");
    let RawMessage::Text(text) = raw else {
        unreachable!("json serializer produces text frames");
    };
    Message::Text(text)
}

fn reply_to(envelope: &Envelope, status: &str, response: serde_json::Value) -> Message {
    let reply = Envelope::new(
        envelope.join_ref.clone(),
        envelope.msg_ref.clone(),
        envelope.topic.clone(),
        ControlEvent::Reply.as_str(),
        json!({"status": status, "response": response}),
    );
    encode_msg(&reply)
}

async fn handle_conn(stream: TcpStream, state: Arc<ServerState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.accepted.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.writers.lock().unwrap().push(tx.clone());
    let kill = Arc::new(Notify::new());
    state.kills.lock().unwrap().push(kill.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            () = kill.notified() => break,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(envelope) = JsonSerializer.decode(&RawMessage::Text(text)) {
                        state.received.lock().unwrap().push(envelope.clone());
                        respond(&envelope, &tx, &state);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            }
        }
    }

    // Dropping both halves tears the connection down without a close
    // handshake, which is exactly what the reconnect tests need.
    writer.abort();
}

fn respond(envelope: &Envelope, tx: &mpsc::UnboundedSender<Message>, state: &Arc<ServerState>) {
    if envelope.topic == HEARTBEAT_TOPIC {
        if state.reply_to_heartbeat.load(Ordering::SeqCst) {
            let _ = tx.send(reply_to(envelope, "ok", json!({})));
        }
        return;
    }

    match envelope.event.as_str() {
        "phx_join" => {
            if envelope.topic.starts_with("reject:") {
                let _ = tx.send(reply_to(envelope, "error", json!({"reason": "rejected"})));
            } else if envelope.topic.starts_with("silent:") {
                // no reply; the client's timeout fires
            } else if envelope.topic.starts_with("slow:") {
                let tx = tx.clone();
                let envelope = envelope.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let _ = tx.send(reply_to(&envelope, "ok", json!({})));
                });
            } else {
                let _ = tx.send(reply_to(envelope, "ok", json!({})));
            }
        }
        "phx_leave" => {
            let _ = tx.send(reply_to(envelope, "ok", json!({})));
        }
        "echo" => {
            let _ = tx.send(reply_to(envelope, "ok", envelope.payload.clone()));
        }
        _ => {
            if envelope.msg_ref.is_some() {
                let _ = tx.send(reply_to(envelope, "ok", json!({})));
            }
        }
    }
}
