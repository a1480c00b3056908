//! Socket: the single multiplexed connection.
//!
//! The socket owns one transport instance at a time (replaced wholesale on
//! every attempt), the reconnect backoff timer, the heartbeat, the outbound
//! buffer used while the transport is down, and the registry of channels it
//! routes inbound envelopes to.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use beacon_protocol::{Envelope, RawMessage, VERSION_PARAM, WIRE_VERSION};
use beacon_transport::{
    ajax, Framing, LongPollTransport, Transport, TransportEvent, TransportKind, TransportSender,
    WebSocketTransport,
};

use crate::channel::{Channel, ChannelState};
use crate::config::{ParamsFn, SocketConfig};
use crate::timer::BackoffTimer;

/// Connection states, mirroring the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// A transport attempt is in flight.
    Connecting,
    /// The transport is open.
    Open,
    /// An explicit disconnect is in flight.
    Closing,
    /// No transport.
    Closed,
}

pub(crate) struct SocketInner {
    endpoint_url: String,
    pub(crate) config: SocketConfig,
    state: Mutex<SocketState>,
    channels: Mutex<Vec<Channel>>,
    send_buffer: Mutex<Vec<Envelope>>,
    ref_counter: AtomicU64,
    sender: Mutex<Option<Arc<dyn TransportSender>>>,
    epoch: AtomicU64,
    closed_by_user: AtomicBool,
    reconnect_timer: BackoffTimer,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    pending_heartbeat_ref: Mutex<Option<String>>,
    close_notify: Notify,
}

/// A resilient connection multiplexing any number of topic channels.
///
/// Cheap to clone; all clones share the same connection. Requires a tokio
/// runtime.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Create a socket for the given endpoint.
    ///
    /// The endpoint URL is extended with the wire version and any handshake
    /// params from the configuration. No connection is attempted until
    /// [`Socket::connect`].
    pub fn new(endpoint: impl Into<String>, config: SocketConfig) -> Self {
        let endpoint = endpoint.into();
        let mut params = serde_json::Map::new();
        params.insert(
            VERSION_PARAM.to_string(),
            Value::String(WIRE_VERSION.to_string()),
        );
        if let Value::Object(user) = &config.params {
            for (key, value) in user {
                params.insert(key.clone(), value.clone());
            }
        }
        let endpoint_url = ajax::append_params(&endpoint, &Value::Object(params));

        let reconnect_after = config.reconnect_after.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let weak = weak.clone();
            SocketInner {
                endpoint_url,
                config,
                state: Mutex::new(SocketState::Closed),
                channels: Mutex::new(Vec::new()),
                send_buffer: Mutex::new(Vec::new()),
                ref_counter: AtomicU64::new(0),
                sender: Mutex::new(None),
                epoch: AtomicU64::new(0),
                closed_by_user: AtomicBool::new(false),
                reconnect_timer: BackoffTimer::new(
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            SocketInner::spawn_connect(&inner);
                        }
                    },
                    move |tries| reconnect_after(tries),
                ),
                heartbeat: Mutex::new(None),
                pending_heartbeat_ref: Mutex::new(None),
                close_notify: Notify::new(),
            }
        });
        Self { inner }
    }

    /// Get the full endpoint URL, version and handshake params included.
    #[must_use]
    pub fn endpoint_url(&self) -> &str {
        &self.inner.endpoint_url
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> SocketState {
        *self.inner.state.lock().expect("socket lock poisoned")
    }

    /// Check whether the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_open()
    }

    /// Start connecting.
    ///
    /// Returns immediately; progress is observable through channel state and
    /// push replies. Retries run on the reconnect backoff until
    /// [`Socket::disconnect`].
    pub fn connect(&self) {
        SocketInner::spawn_connect(&self.inner);
    }

    /// Disconnect and suppress automatic reconnection.
    ///
    /// Resolves once the transport has closed.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<String>) {
        let inner = &self.inner;
        inner.closed_by_user.store(true, Ordering::SeqCst);
        inner.reconnect_timer.reset();

        let sender = inner.sender.lock().expect("socket lock poisoned").clone();
        let Some(sender) = sender else {
            inner.set_state(SocketState::Closed);
            return;
        };

        inner.set_state(SocketState::Closing);
        let _ = sender.close(code, reason);
        loop {
            if self.connection_state() == SocketState::Closed {
                return;
            }
            let notified = inner.close_notify.notified();
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Get the channel for a topic, creating and registering it on first
    /// use. The socket is the only factory for channels sharing its
    /// transport.
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Channel {
        self.channel_with(topic, Arc::new(move || params.clone()))
    }

    /// Like [`Socket::channel`], with lazily-evaluated params re-read on
    /// every join attempt.
    pub fn channel_with(&self, topic: impl Into<String>, params: ParamsFn) -> Channel {
        let topic = topic.into();
        let mut channels = self.inner.channels.lock().expect("socket lock poisoned");
        if let Some(existing) = channels.iter().find(|c| c.topic() == topic) {
            return existing.clone();
        }
        let channel = Channel::new(&self.inner, topic, params);
        channels.push(channel.clone());
        channel
    }
}

impl SocketInner {
    pub(crate) fn is_open(&self) -> bool {
        *self.state.lock().expect("socket lock poisoned") == SocketState::Open
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock().expect("socket lock poisoned") = state;
    }

    /// Allocate the next globally unique message reference.
    pub(crate) fn make_ref(&self) -> String {
        // Wraps only at integer overflow; treated as unbounded.
        let next = self
            .ref_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        next.to_string()
    }

    /// Forget a channel after it closed.
    pub(crate) fn remove_channel(&self, target: &Arc<crate::channel::ChannelInner>) {
        self.channels
            .lock()
            .expect("socket lock poisoned")
            .retain(|c| !Arc::ptr_eq(&c.inner, target));
    }

    /// Send an envelope now, or buffer it until the transport opens.
    pub(crate) fn push(&self, envelope: Envelope) {
        if self.is_open() {
            self.transmit(envelope);
        } else {
            trace!(
                topic = %envelope.topic,
                event = %envelope.event,
                "buffering frame until open"
            );
            self.send_buffer
                .lock()
                .expect("socket lock poisoned")
                .push(envelope);
        }
    }

    fn transmit(&self, envelope: Envelope) {
        trace!(
            topic = %envelope.topic,
            event = %envelope.event,
            msg_ref = ?envelope.msg_ref,
            "sending frame"
        );
        let raw = match self.config.serializer.encode(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "failed to encode frame");
                return;
            }
        };
        let sender = self.sender.lock().expect("socket lock poisoned").clone();
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(raw) {
                    warn!(error = %e, "transport send failed");
                }
            }
            None => warn!("no transport; frame dropped"),
        }
    }

    fn flush_send_buffer(&self) {
        if !self.is_open() {
            return;
        }
        let buffered: Vec<Envelope> =
            std::mem::take(&mut *self.send_buffer.lock().expect("socket lock poisoned"));
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "flushing buffered frames");
        }
        for envelope in buffered {
            self.transmit(envelope);
        }
    }

    fn channels_snapshot(&self) -> Vec<Channel> {
        self.channels
            .lock()
            .expect("socket lock poisoned")
            .clone()
    }

    /// Start a connection attempt on a fresh transport instance.
    pub(crate) fn spawn_connect(inner: &Arc<SocketInner>) {
        {
            let mut state = inner.state.lock().expect("socket lock poisoned");
            if matches!(
                *state,
                SocketState::Connecting | SocketState::Open | SocketState::Closing
            ) {
                return;
            }
            *state = SocketState::Connecting;
        }
        inner.closed_by_user.store(false, Ordering::SeqCst);
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let transport: Box<dyn Transport> = match inner.config.transport {
                TransportKind::WebSocket => {
                    let framing = if inner.config.serializer.is_binary() {
                        Framing::Binary
                    } else {
                        Framing::Text
                    };
                    Box::new(WebSocketTransport::new(framing))
                }
                TransportKind::LongPoll => {
                    Box::new(LongPollTransport::new(inner.config.longpoll.clone()))
                }
            };
            debug!(
                transport = transport.name(),
                url = %inner.endpoint_url,
                "connecting"
            );

            match transport.connect(&inner.endpoint_url).await {
                Ok((sender, mut events)) => {
                    // A newer attempt or an explicit disconnect supersedes
                    // this one.
                    if inner.epoch.load(Ordering::SeqCst) != epoch
                        || inner.closed_by_user.load(Ordering::SeqCst)
                    {
                        let _ = sender.close(None, None);
                        return;
                    }
                    *inner.sender.lock().expect("socket lock poisoned") =
                        Some(Arc::from(sender));

                    while let Some(event) = events.recv().await {
                        if inner.epoch.load(Ordering::SeqCst) != epoch {
                            break;
                        }
                        match event {
                            TransportEvent::Open => inner.on_open(),
                            TransportEvent::Message(raw) => inner.on_message(&raw),
                            TransportEvent::Error(reason) => inner.on_error(&reason),
                            TransportEvent::Closed { code, reason } => {
                                inner.on_close(code, reason);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connect attempt failed");
                    if inner.epoch.load(Ordering::SeqCst) == epoch {
                        inner.on_error(&e.to_string());
                        inner.on_close(None, Some(e.to_string()));
                    }
                }
            }
        });
    }

    fn on_open(self: &Arc<Self>) {
        if self.closed_by_user.load(Ordering::SeqCst) {
            let sender = self.sender.lock().expect("socket lock poisoned").clone();
            if let Some(sender) = sender {
                let _ = sender.close(None, None);
            }
            return;
        }
        debug!(url = %self.endpoint_url, "connection opened");
        self.set_state(SocketState::Open);
        self.reconnect_timer.reset();
        self.flush_send_buffer();
        self.start_heartbeat();

        for channel in self.channels_snapshot() {
            if channel.state() == ChannelState::Errored {
                channel.rejoin_from_socket();
            }
        }
    }

    fn on_message(&self, raw: &RawMessage) {
        let envelope = match self.config.serializer.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "failed to decode frame");
                return;
            }
        };
        trace!(
            topic = %envelope.topic,
            event = %envelope.event,
            msg_ref = ?envelope.msg_ref,
            "received frame"
        );

        {
            let mut pending = self
                .pending_heartbeat_ref
                .lock()
                .expect("socket lock poisoned");
            if pending.is_some() && *pending == envelope.msg_ref {
                trace!("heartbeat acknowledged");
                *pending = None;
            }
        }

        let members: Vec<Channel> = self
            .channels
            .lock()
            .expect("socket lock poisoned")
            .iter()
            .filter(|channel| channel.is_member(&envelope))
            .cloned()
            .collect();
        if members.is_empty() {
            trace!(
                topic = %envelope.topic,
                event = %envelope.event,
                "dropping frame with no member channel"
            );
            return;
        }
        for channel in members {
            channel.handle_envelope(&envelope);
        }
    }

    fn on_error(&self, reason: &str) {
        warn!(reason = %reason, "transport error");
        for channel in self.channels_snapshot() {
            channel.trigger_socket_error();
        }
    }

    fn on_close(&self, code: Option<u16>, reason: Option<String>) {
        debug!(code = ?code, reason = ?reason, "transport closed");
        self.stop_heartbeat();
        *self
            .pending_heartbeat_ref
            .lock()
            .expect("socket lock poisoned") = None;
        *self.sender.lock().expect("socket lock poisoned") = None;
        // Buffered frames are dropped, not retried; channel state is what
        // survives a reconnect.
        self.send_buffer
            .lock()
            .expect("socket lock poisoned")
            .clear();
        self.set_state(SocketState::Closed);

        if !self.closed_by_user.load(Ordering::SeqCst) {
            self.reconnect_timer.schedule_timeout();
        }
        for channel in self.channels_snapshot() {
            channel.trigger_socket_error();
        }
        self.close_notify.notify_one();
    }

    fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat();
        *self
            .pending_heartbeat_ref
            .lock()
            .expect("socket lock poisoned") = None;

        let interval = self.config.heartbeat_interval;
        if interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_open() {
                    break;
                }
                inner.send_heartbeat();
            }
        });
        *self.heartbeat.lock().expect("socket lock poisoned") = Some(handle);
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().expect("socket lock poisoned").take() {
            handle.abort();
        }
    }

    fn send_heartbeat(&self) {
        let missed = {
            let mut pending = self
                .pending_heartbeat_ref
                .lock()
                .expect("socket lock poisoned");
            if pending.is_some() {
                *pending = None;
                true
            } else {
                false
            }
        };

        if missed {
            warn!("heartbeat unacknowledged; closing transport");
            let sender = self.sender.lock().expect("socket lock poisoned").clone();
            if let Some(sender) = sender {
                let _ = sender.close(Some(1000), Some("heartbeat timeout".to_string()));
            }
            return;
        }

        let heartbeat_ref = self.make_ref();
        *self
            .pending_heartbeat_ref
            .lock()
            .expect("socket lock poisoned") = Some(heartbeat_ref.clone());
        self.push(Envelope::heartbeat(heartbeat_ref));
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint_url", &self.inner.endpoint_url)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_url_carries_version_and_params() {
        let config = SocketConfig {
            params: json!({"token": "abc"}),
            ..SocketConfig::default()
        };
        let socket = Socket::new("ws://host/socket", config);
        assert_eq!(socket.endpoint_url(), "ws://host/socket?token=abc&vsn=2.0.0");
    }

    #[test]
    fn test_initial_state_is_closed() {
        let socket = Socket::new("ws://host/socket", SocketConfig::default());
        assert_eq!(socket.connection_state(), SocketState::Closed);
        assert!(!socket.is_connected());
    }

    #[test]
    fn test_refs_are_monotonic() {
        let socket = Socket::new("ws://host/socket", SocketConfig::default());
        assert_eq!(socket.inner.make_ref(), "1");
        assert_eq!(socket.inner.make_ref(), "2");
        assert_eq!(socket.inner.make_ref(), "3");
    }

    #[test]
    fn test_channel_factory_returns_existing_channel_per_topic() {
        let socket = Socket::new("ws://host/socket", SocketConfig::default());
        let a = socket.channel("room:lobby", json!({}));
        let b = socket.channel("room:lobby", json!({}));
        let c = socket.channel("room:other", json!({}));
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
    }

    #[test]
    fn test_offline_push_is_buffered() {
        let socket = Socket::new("ws://host/socket", SocketConfig::default());
        socket
            .inner
            .push(Envelope::new(None, None, "room:a", "shout", json!({})));
        assert_eq!(socket.inner.send_buffer.lock().unwrap().len(), 1);
    }
}
