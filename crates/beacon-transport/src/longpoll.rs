//! HTTP long-poll transport implementation.
//!
//! Simulates a duplex stream over repeated request/response cycles: a GET
//! poll loop delivers server-to-client frames, outbound frames are queued
//! client-side and POSTed between polls. A session token issued by the
//! server on the first poll is threaded through every subsequent request.
//!
//! The event contract is identical to the websocket transport: `Open` once,
//! `Message` per delivered frame, `Closed` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use async_trait::async_trait;
use beacon_protocol::RawMessage;

use crate::ajax;
use crate::traits::{Transport, TransportError, TransportEvent, TransportReceiver, TransportSender};

/// Long-poll transport configuration.
#[derive(Debug, Clone)]
pub struct LongPollConfig {
    /// How long a single poll request may be held by the server.
    pub poll_timeout: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Timeout for publish requests.
    pub request_timeout: Duration,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP long-poll transport.
#[derive(Debug, Clone, Default)]
pub struct LongPollTransport {
    config: LongPollConfig,
}

impl LongPollTransport {
    /// Create a new long-poll transport.
    #[must_use]
    pub fn new(config: LongPollConfig) -> Self {
        Self { config }
    }

    /// Swap a `ws(s)` scheme for the matching `http(s)` scheme.
    fn http_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            url.to_string()
        }
    }
}

#[async_trait]
impl Transport for LongPollTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSender>, TransportReceiver), TransportError> {
        let url = Self::http_url(url);
        debug!(url = %url, "starting long-poll session");

        let client = Client::builder().build()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Shutdown::default());
        let token = Arc::new(Mutex::new(None));

        tokio::spawn(poll_loop(
            client.clone(),
            url.clone(),
            token.clone(),
            event_tx.clone(),
            shutdown.clone(),
            self.config.clone(),
        ));
        tokio::spawn(send_loop(
            client,
            url,
            token,
            out_rx,
            event_tx,
            shutdown.clone(),
            self.config.clone(),
        ));

        let sender = LongPollSender {
            out: out_tx,
            shutdown,
        };
        Ok((Box::new(sender), event_rx))
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }
}

/// Shared shutdown intent between the sender handle and the loops.
#[derive(Debug, Default)]
struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct LongPollSender {
    out: mpsc::UnboundedSender<RawMessage>,
    shutdown: Arc<Shutdown>,
}

impl TransportSender for LongPollSender {
    fn send(&self, msg: RawMessage) -> Result<(), TransportError> {
        if self.shutdown.is_shutdown() {
            return Err(TransportError::NotOpen);
        }
        self.out
            .send(msg)
            .map_err(|_| TransportError::SendFailed("send loop stopped".to_string()))
    }

    fn close(&self, _code: Option<u16>, _reason: Option<String>) -> Result<(), TransportError> {
        self.shutdown.trigger();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.shutdown.is_shutdown()
    }
}

/// Body shape of a poll response.
#[derive(Debug, Deserialize)]
struct PollResponse {
    status: u16,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

fn session_url(base: &str, token: &Arc<Mutex<Option<String>>>) -> String {
    let token = token.lock().expect("token lock poisoned").clone();
    match token {
        Some(t) => ajax::append_params(base, &json!({ "token": t })),
        None => base.to_string(),
    }
}

async fn poll_loop(
    client: Client,
    base_url: String,
    token: Arc<Mutex<Option<String>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Arc<Shutdown>,
    config: LongPollConfig,
) {
    let mut opened = false;
    let mut close_reason = None;

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let url = session_url(&base_url, &token);
        let response = tokio::select! {
            () = shutdown.notify.notified() => break,
            r = ajax::request(&client, Method::GET, &url, &[], None, config.poll_timeout) => r,
        };

        match response {
            Ok(Some(body)) => {
                let poll: PollResponse = match serde_json::from_value(body) {
                    Ok(poll) => poll,
                    Err(e) => {
                        warn!(error = %e, "malformed poll response");
                        let reason = "malformed poll response".to_string();
                        let _ = events.send(TransportEvent::Error(reason.clone()));
                        close_reason = Some(reason);
                        break;
                    }
                };
                if let Some(t) = poll.token {
                    *token.lock().expect("token lock poisoned") = Some(t);
                }
                match poll.status {
                    200 | 204 | 410 => {
                        if poll.status == 410 {
                            trace!("long-poll session established");
                        }
                        if !opened {
                            opened = true;
                            let _ = events.send(TransportEvent::Open);
                        }
                        for message in poll.messages {
                            let _ = events.send(TransportEvent::Message(RawMessage::Text(message)));
                        }
                    }
                    403 => {
                        warn!("long-poll session forbidden");
                        let reason = "forbidden".to_string();
                        let _ = events.send(TransportEvent::Error(reason.clone()));
                        close_reason = Some(reason);
                        break;
                    }
                    status => {
                        warn!(status, "unexpected long-poll status");
                        let reason = format!("unexpected long-poll status {status}");
                        let _ = events.send(TransportEvent::Error(reason.clone()));
                        close_reason = Some(reason);
                        break;
                    }
                }
            }
            // The poll window elapsed with nothing to deliver.
            Err(TransportError::Timeout) => continue,
            Ok(None) | Err(_) => {
                let reason = "poll request failed".to_string();
                let _ = events.send(TransportEvent::Error(reason.clone()));
                close_reason = Some(reason);
                break;
            }
        }

        tokio::select! {
            () = shutdown.notify.notified() => break,
            () = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    shutdown.trigger();
    let _ = events.send(TransportEvent::Closed {
        code: None,
        reason: close_reason,
    });
    debug!("long-poll session ended");
}

async fn send_loop(
    client: Client,
    base_url: String,
    token: Arc<Mutex<Option<String>>>,
    mut out: mpsc::UnboundedReceiver<RawMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Arc<Shutdown>,
    config: LongPollConfig,
) {
    loop {
        let msg = tokio::select! {
            () = shutdown.notify.notified() => break,
            m = out.recv() => match m { Some(m) => m, None => break },
        };
        if shutdown.is_shutdown() {
            break;
        }

        let body = match msg {
            RawMessage::Text(text) => text,
            RawMessage::Binary(_) => {
                warn!("dropping binary frame on long-poll transport");
                continue;
            }
        };

        let url = session_url(&base_url, &token);
        let response = ajax::request(
            &client,
            Method::POST,
            &url,
            &[],
            Some(body),
            config.request_timeout,
        )
        .await;

        let ok = matches!(
            &response,
            Ok(Some(value)) if value.get("status").and_then(serde_json::Value::as_u64) == Some(200)
        );
        if !ok {
            let reason = match response {
                Err(TransportError::Timeout) => "publish timed out".to_string(),
                _ => "publish failed".to_string(),
            };
            warn!(reason = %reason, "long-poll publish error");
            let _ = events.send(TransportEvent::Error(reason));
            shutdown.trigger();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url_scheme_swap() {
        assert_eq!(LongPollTransport::http_url("ws://host/lp"), "http://host/lp");
        assert_eq!(
            LongPollTransport::http_url("wss://host/lp"),
            "https://host/lp"
        );
        assert_eq!(
            LongPollTransport::http_url("http://host/lp"),
            "http://host/lp"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = LongPollConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(20));
        assert!(config.poll_interval < config.poll_timeout);
    }
}
