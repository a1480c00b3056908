//! Push: one outbound event awaiting at most one correlated reply.
//!
//! A push owns its receive hooks and its timeout. The message reference and
//! the synthetic reply event are allocated when the push is actually sent,
//! not at construction, so a push buffered before its channel joins gets a
//! fresh reference when it finally goes out.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use beacon_protocol::{reply_event, Envelope, Reply};

use crate::channel::ChannelInner;
use crate::config::ParamsFn;

/// Callback invoked with the response value of a matching reply.
pub type ReceiveCallback = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    payload: ParamsFn,
    timeout: Mutex<Duration>,
    received: Mutex<Option<Reply>>,
    hooks: Mutex<Vec<(String, ReceiveCallback)>>,
    msg_ref: Mutex<Option<String>>,
    listener: Mutex<Option<(String, u64)>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

/// One in-flight request/acknowledgement pair.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

impl Push {
    pub(crate) fn new(
        channel: &Arc<ChannelInner>,
        event: &str,
        payload: ParamsFn,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                channel: Arc::downgrade(channel),
                event: event.to_string(),
                payload,
                timeout: Mutex::new(timeout),
                received: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
                msg_ref: Mutex::new(None),
                listener: Mutex::new(None),
                timeout_task: Mutex::new(None),
            }),
        }
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Get the message reference, if the push has been sent.
    #[must_use]
    pub fn msg_ref(&self) -> Option<String> {
        self.inner.msg_ref.lock().expect("push lock poisoned").clone()
    }

    /// Check whether a reply with the given status has been received.
    #[must_use]
    pub fn has_received(&self, status: &str) -> bool {
        self.inner
            .received
            .lock()
            .expect("push lock poisoned")
            .as_ref()
            .is_some_and(|reply| reply.status == status)
    }

    /// Register a hook for replies with the given status.
    ///
    /// Multiple hooks per status coexist and all fire on a match. If a
    /// matching reply was already received, the hook fires synchronously
    /// before this call returns, so hooks attached late never miss the
    /// reply. Returns the push for chaining.
    pub fn receive(
        &self,
        status: impl Into<String>,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Self {
        let status = status.into();
        let callback: ReceiveCallback = Arc::new(callback);

        let already = {
            let received = self.inner.received.lock().expect("push lock poisoned");
            match &*received {
                Some(reply) if reply.status == status => Some(reply.response.clone()),
                // Register while holding the received lock so a concurrent
                // reply cannot slip between the check and the registration.
                _ => {
                    self.inner
                        .hooks
                        .lock()
                        .expect("push lock poisoned")
                        .push((status.clone(), callback.clone()));
                    None
                }
            }
        };

        if let Some(response) = already {
            callback(&response);
            self.inner
                .hooks
                .lock()
                .expect("push lock poisoned")
                .push((status, callback));
        }
        self.clone()
    }

    /// Send the push over the owning channel's socket.
    ///
    /// Allocates the message reference and reply listener and starts the
    /// timeout. Requires the channel's join reference to be established by
    /// the caller's state machine.
    pub(crate) fn send(&self) {
        if self.has_received("timeout") {
            return;
        }
        let Some(channel) = self.inner.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        self.start_timeout(&channel, &socket);

        let msg_ref = self.msg_ref();
        let join_ref = channel.join_ref();
        trace!(
            topic = %channel.topic(),
            event = %self.inner.event,
            msg_ref = ?msg_ref,
            "sending push"
        );
        socket.push(Envelope::new(
            join_ref,
            msg_ref,
            channel.topic(),
            self.inner.event.clone(),
            (self.inner.payload)(),
        ));
    }

    /// Rebuild and resend with a fresh timeout; used when a channel rejoins.
    pub(crate) fn resend(&self, timeout: Duration) {
        *self.inner.timeout.lock().expect("push lock poisoned") = timeout;
        self.reset();
        self.send();
    }

    fn reset(&self) {
        self.cancel_timeout();
        self.cancel_listener();
        *self.inner.msg_ref.lock().expect("push lock poisoned") = None;
        *self.inner.received.lock().expect("push lock poisoned") = None;
    }

    /// Abort the timeout task, if one is running.
    pub(crate) fn cancel_timeout(&self) {
        if let Some(handle) = self
            .inner
            .timeout_task
            .lock()
            .expect("push lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    fn cancel_listener(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .expect("push lock poisoned")
            .take();
        if let Some((event, binding_ref)) = listener {
            if let Some(channel) = self.inner.channel.upgrade() {
                channel.unbind(&event, binding_ref);
            }
        }
    }

    fn start_timeout(&self, channel: &Arc<ChannelInner>, socket: &Arc<crate::socket::SocketInner>) {
        self.cancel_timeout();
        self.cancel_listener();

        let msg_ref = socket.make_ref();
        let event = reply_event(&msg_ref);
        *self.inner.msg_ref.lock().expect("push lock poisoned") = Some(msg_ref);

        // One-shot reply listener; unbound again when the reply (or the
        // synthesized timeout) lands.
        let push = Arc::downgrade(&self.inner);
        let binding_ref = channel.bind(
            event.clone(),
            Arc::new(move |payload: &Value, _msg_ref: Option<&str>| {
                if let Some(inner) = push.upgrade() {
                    Push { inner }.on_reply(payload);
                }
            }),
        );
        *self.inner.listener.lock().expect("push lock poisoned") = Some((event.clone(), binding_ref));

        let timeout = *self.inner.timeout.lock().expect("push lock poisoned");
        let channel = Arc::downgrade(channel);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(channel) = channel.upgrade() {
                channel.dispatch(&event, &Reply::timeout().into_payload(), None);
            }
        });
        *self.inner.timeout_task.lock().expect("push lock poisoned") = Some(handle);
    }

    fn on_reply(&self, payload: &Value) {
        let Some(reply) = Reply::from_payload(payload) else {
            warn!(event = %self.inner.event, "discarding reply without a status");
            return;
        };
        self.finish(reply);
    }

    /// Resolve the push with a locally produced reply.
    pub(crate) fn trigger_reply(&self, reply: Reply) {
        self.finish(reply);
    }

    fn finish(&self, reply: Reply) {
        {
            let mut received = self.inner.received.lock().expect("push lock poisoned");
            // Whichever of {reply, timeout} lands first wins; the loser is a
            // no-op.
            if received.is_some() {
                return;
            }
            *received = Some(reply.clone());
        }
        self.cancel_timeout();
        self.cancel_listener();

        let matching: Vec<ReceiveCallback> = self
            .inner
            .hooks
            .lock()
            .expect("push lock poisoned")
            .iter()
            .filter(|(status, _)| *status == reply.status)
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in matching {
            callback(&reply.response);
        }
    }
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("msg_ref", &self.msg_ref())
            .finish_non_exhaustive()
    }
}
