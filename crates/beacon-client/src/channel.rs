//! Channel: one topic subscription with its own join lifecycle.
//!
//! A channel is created through [`Socket::channel`](crate::Socket::channel)
//! and owns a join state machine, the pushes buffered until the join
//! completes, the event bindings, and a rejoin backoff timer independent of
//! the socket's reconnect timer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace, warn};

use beacon_protocol::{reply_event, ControlEvent, Envelope};

use crate::config::ParamsFn;
use crate::push::Push;
use crate::socket::SocketInner;
use crate::timer::BackoffTimer;

/// Channel join states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Initial state, and terminal state after a leave.
    Closed,
    /// Join failed or the connection dropped; a rejoin is pending.
    Errored,
    /// Join acknowledged by the server.
    Joined,
    /// Join request in flight.
    Joining,
    /// Leave request in flight.
    Leaving,
}

/// Usage errors signaled synchronously to the caller.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `join` was called more than once on the same channel instance.
    #[error("channel {topic:?} tried to join multiple times")]
    AlreadyJoined {
        /// The channel topic.
        topic: String,
    },

    /// A push was attempted before `join` was ever called.
    #[error("unable to push {event:?} on {topic:?} before joining the channel")]
    NotJoined {
        /// The channel topic.
        topic: String,
        /// The push event.
        event: String,
    },
}

/// Callback invoked with an inbound payload and its message reference.
pub type BindingCallback = Arc<dyn Fn(&Value, Option<&str>) + Send + Sync>;

struct Binding {
    event: String,
    binding_ref: u64,
    callback: BindingCallback,
}

pub(crate) struct ChannelInner {
    topic: String,
    params: Mutex<ParamsFn>,
    socket: Weak<SocketInner>,
    state: Mutex<ChannelState>,
    join_push: Mutex<Option<Push>>,
    push_buffer: Mutex<Vec<Push>>,
    bindings: Mutex<Vec<Binding>>,
    binding_ref: AtomicU64,
    joined_once: AtomicBool,
    rejoin_timer: BackoffTimer,
    timeout: Mutex<Duration>,
}

/// One topic subscription multiplexed over a [`Socket`](crate::Socket).
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(socket: &Arc<SocketInner>, topic: String, params: ParamsFn) -> Self {
        let rejoin_after = socket.config.rejoin_after.clone();
        let timeout = socket.config.timeout;
        let socket = Arc::downgrade(socket);

        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let weak = weak.clone();
            ChannelInner {
                topic,
                params: Mutex::new(params),
                socket,
                state: Mutex::new(ChannelState::Closed),
                join_push: Mutex::new(None),
                push_buffer: Mutex::new(Vec::new()),
                bindings: Mutex::new(Vec::new()),
                binding_ref: AtomicU64::new(0),
                joined_once: AtomicBool::new(false),
                rejoin_timer: BackoffTimer::new(
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            ChannelInner::rejoin(&inner);
                        }
                    },
                    move |tries| rejoin_after(tries),
                ),
                timeout: Mutex::new(timeout),
            }
        });
        Self { inner }
    }

    /// Get the channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Get the current join state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("channel lock poisoned")
    }

    /// Check whether the channel is joined.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Get the reference of the current join attempt, once one was sent.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Join the channel.
    ///
    /// A channel instance may be joined at most once; rejoins after errors
    /// are automatic. Returns the join push so reply hooks can be attached.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyJoined`] on a second call.
    pub fn join(&self, timeout: Option<Duration>) -> Result<Push, ChannelError> {
        if self.inner.joined_once.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyJoined {
                topic: self.inner.topic.clone(),
            });
        }
        if let Some(timeout) = timeout {
            *self.inner.timeout.lock().expect("channel lock poisoned") = timeout;
        }
        let push = self.inner.ensure_join_push();
        ChannelInner::rejoin(&self.inner);
        Ok(push)
    }

    /// Push an event with a fixed payload.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotJoined`] if `join` has never been called.
    pub fn push(&self, event: impl Into<String>, payload: Value) -> Result<Push, ChannelError> {
        self.push_with(event, Arc::new(move || payload.clone()), None)
    }

    /// Push an event with a lazily-evaluated payload and an optional
    /// per-push timeout.
    ///
    /// If the join has not completed yet the push is buffered and sent, in
    /// order, once it does; reply hooks can be attached in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotJoined`] if `join` has never been called.
    pub fn push_with(
        &self,
        event: impl Into<String>,
        payload: ParamsFn,
        timeout: Option<Duration>,
    ) -> Result<Push, ChannelError> {
        let event = event.into();
        if !self.inner.joined_once.load(Ordering::SeqCst) {
            return Err(ChannelError::NotJoined {
                topic: self.inner.topic.clone(),
                event,
            });
        }
        let timeout =
            timeout.unwrap_or(*self.inner.timeout.lock().expect("channel lock poisoned"));
        let push = Push::new(&self.inner, &event, payload, timeout);
        if self.inner.can_push() {
            push.send();
        } else {
            trace!(topic = %self.inner.topic, event = %event, "buffering push until joined");
            self.inner
                .push_buffer
                .lock()
                .expect("channel lock poisoned")
                .push(push.clone());
        }
        Ok(push)
    }

    /// Leave the channel.
    ///
    /// Sends a leave request; on any outcome (reply or timeout) the channel
    /// closes, its bindings and buffered pushes are discarded, and the
    /// socket forgets it. The instance cannot be rejoined.
    pub fn leave(&self, timeout: Option<Duration>) -> Push {
        let inner = &self.inner;
        inner.rejoin_timer.reset();
        if let Some(join_push) = inner
            .join_push
            .lock()
            .expect("channel lock poisoned")
            .clone()
        {
            join_push.cancel_timeout();
        }
        let was_pushable = inner.can_push();
        *inner.state.lock().expect("channel lock poisoned") = ChannelState::Leaving;
        debug!(topic = %inner.topic, "leaving channel");

        let timeout = timeout.unwrap_or(*inner.timeout.lock().expect("channel lock poisoned"));
        let push = Push::new(
            inner,
            ControlEvent::Leave.as_str(),
            Arc::new(|| json!({})),
            timeout,
        );
        {
            let weak = Arc::downgrade(inner);
            push.receive("ok", move |_| {
                if let Some(inner) = weak.upgrade() {
                    ChannelInner::close_channel(&inner, "leave");
                }
            });
        }
        {
            let weak = Arc::downgrade(inner);
            push.receive("timeout", move |_| {
                if let Some(inner) = weak.upgrade() {
                    ChannelInner::close_channel(&inner, "leave");
                }
            });
        }

        if was_pushable {
            push.send();
        } else {
            // Nothing to tell the server; resolve the leave locally.
            push.trigger_reply(beacon_protocol::Reply::ok(json!({})));
        }
        push
    }

    /// Register a callback for an inbound event.
    ///
    /// Multiple bindings per event coexist and fire in registration order.
    /// Returns a binding reference usable with [`Channel::off`].
    pub fn on(
        &self,
        event: impl Into<String>,
        callback: impl Fn(&Value, Option<&str>) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.bind(event.into(), Arc::new(callback))
    }

    /// Remove bindings for an event.
    ///
    /// With a binding reference only that binding is removed; with `None`
    /// every binding for the event is removed.
    pub fn off(&self, event: &str, binding_ref: Option<u64>) {
        self.inner
            .bindings
            .lock()
            .expect("channel lock poisoned")
            .retain(|b| !(b.event == event && binding_ref.map_or(true, |r| r == b.binding_ref)));
    }

    /// Register a callback invoked when the channel closes.
    pub fn on_close(&self, callback: impl Fn(&Value, Option<&str>) + Send + Sync + 'static) -> u64 {
        self.on(ControlEvent::Close.as_str(), callback)
    }

    /// Register a callback invoked when the channel errors.
    pub fn on_error(&self, callback: impl Fn(&Value, Option<&str>) + Send + Sync + 'static) -> u64 {
        self.on(ControlEvent::Error.as_str(), callback)
    }

    /// Check whether an inbound envelope belongs to this channel.
    ///
    /// Frames carrying a join reference from a superseded join are dropped.
    pub(crate) fn is_member(&self, envelope: &Envelope) -> bool {
        if self.inner.topic != envelope.topic {
            return false;
        }
        match &envelope.join_ref {
            None => true,
            Some(join_ref) if self.inner.join_ref().as_ref() == Some(join_ref) => true,
            Some(_) => {
                trace!(
                    topic = %self.inner.topic,
                    event = %envelope.event,
                    "dropping frame from outdated join"
                );
                false
            }
        }
    }

    pub(crate) fn handle_envelope(&self, envelope: &Envelope) {
        ChannelInner::handle_envelope(&self.inner, envelope);
    }

    /// Transport-level failure: mark the channel errored.
    pub(crate) fn trigger_socket_error(&self) {
        let state = self.state();
        if matches!(
            state,
            ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
        ) {
            return;
        }
        ChannelInner::on_remote_error(&self.inner, &Value::Null);
    }

    /// Connection reopened: retry the join immediately with a fresh backoff.
    pub(crate) fn rejoin_from_socket(&self) {
        self.inner.rejoin_timer.reset();
        ChannelInner::rejoin(&self.inner);
    }
}

impl ChannelInner {
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn socket(&self) -> Option<Arc<SocketInner>> {
        self.socket.upgrade()
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push
            .lock()
            .expect("channel lock poisoned")
            .as_ref()
            .and_then(Push::msg_ref)
    }

    pub(crate) fn bind(&self, event: String, callback: BindingCallback) -> u64 {
        let binding_ref = self.binding_ref.fetch_add(1, Ordering::SeqCst) + 1;
        self.bindings
            .lock()
            .expect("channel lock poisoned")
            .push(Binding {
                event,
                binding_ref,
                callback,
            });
        binding_ref
    }

    pub(crate) fn unbind(&self, event: &str, binding_ref: u64) {
        self.bindings
            .lock()
            .expect("channel lock poisoned")
            .retain(|b| !(b.event == event && b.binding_ref == binding_ref));
    }

    /// Invoke every binding registered for `event`, in registration order.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value, msg_ref: Option<&str>) {
        let callbacks: Vec<BindingCallback> = self
            .bindings
            .lock()
            .expect("channel lock poisoned")
            .iter()
            .filter(|b| b.event == event)
            .map(|b| b.callback.clone())
            .collect();
        for callback in callbacks {
            callback(payload, msg_ref);
        }
    }

    fn can_push(&self) -> bool {
        *self.state.lock().expect("channel lock poisoned") == ChannelState::Joined
            && self.socket_is_open()
    }

    fn socket_is_open(&self) -> bool {
        self.socket.upgrade().is_some_and(|socket| socket.is_open())
    }

    /// Build the join push (once) with its lifecycle hooks.
    fn ensure_join_push(self: &Arc<Self>) -> Push {
        let mut guard = self.join_push.lock().expect("channel lock poisoned");
        if let Some(push) = guard.as_ref() {
            return push.clone();
        }

        // The payload re-reads the channel params at every send so rejoins
        // carry fresh values.
        let weak = Arc::downgrade(self);
        let payload: ParamsFn = Arc::new(move || match weak.upgrade() {
            Some(inner) => (inner.params.lock().expect("channel lock poisoned").clone())(),
            None => Value::Null,
        });

        let timeout = *self.timeout.lock().expect("channel lock poisoned");
        let push = Push::new(self, ControlEvent::Join.as_str(), payload, timeout);
        {
            let weak = Arc::downgrade(self);
            push.receive("ok", move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_join_ok();
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            push.receive("error", move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_join_error();
                }
            });
        }
        {
            let weak = Arc::downgrade(self);
            push.receive("timeout", move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_join_timeout();
                }
            });
        }
        *guard = Some(push.clone());
        push
    }

    pub(crate) fn rejoin(self: &Arc<Self>) {
        if *self.state.lock().expect("channel lock poisoned") == ChannelState::Leaving {
            return;
        }
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Joining;
        let timeout = *self.timeout.lock().expect("channel lock poisoned");
        let push = self.ensure_join_push();
        debug!(topic = %self.topic, "joining channel");
        push.resend(timeout);
    }

    fn on_join_ok(&self) {
        debug!(topic = %self.topic, "channel joined");
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Joined;
        self.rejoin_timer.reset();
        let buffered: Vec<Push> =
            std::mem::take(&mut *self.push_buffer.lock().expect("channel lock poisoned"));
        if !buffered.is_empty() {
            debug!(topic = %self.topic, count = buffered.len(), "flushing buffered pushes");
        }
        for push in buffered {
            push.send();
        }
    }

    fn on_join_error(&self) {
        warn!(topic = %self.topic, "channel join rejected");
        self.mark_errored_and_schedule();
    }

    fn on_join_timeout(&self) {
        if *self.state.lock().expect("channel lock poisoned") != ChannelState::Joining {
            return;
        }
        warn!(topic = %self.topic, "channel join timed out");
        self.mark_errored_and_schedule();
    }

    fn mark_errored_and_schedule(&self) {
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Errored;
        // Only self-schedule while the socket is open; otherwise the
        // socket's reconnect drives the rejoin.
        if self.socket_is_open() {
            self.rejoin_timer.schedule_timeout();
        }
    }

    pub(crate) fn handle_envelope(self: &Arc<Self>, envelope: &Envelope) {
        match ControlEvent::from_event(&envelope.event) {
            Some(ControlEvent::Reply) => {
                if let Some(msg_ref) = &envelope.msg_ref {
                    let event = reply_event(msg_ref);
                    self.dispatch(&event, &envelope.payload, Some(msg_ref));
                }
            }
            Some(ControlEvent::Close) => {
                debug!(topic = %self.topic, "server closed channel");
                self.close_channel("remote");
            }
            Some(ControlEvent::Error) => Self::on_remote_error(self, &envelope.payload),
            Some(ControlEvent::Join | ControlEvent::Leave) => {
                trace!(topic = %self.topic, event = %envelope.event, "ignoring lifecycle event");
            }
            None => self.dispatch(&envelope.event, &envelope.payload, envelope.msg_ref.as_deref()),
        }
    }

    pub(crate) fn on_remote_error(self: &Arc<Self>, payload: &Value) {
        {
            let state = *self.state.lock().expect("channel lock poisoned");
            if matches!(state, ChannelState::Leaving | ChannelState::Closed) {
                return;
            }
        }
        warn!(topic = %self.topic, "channel errored");
        self.dispatch(ControlEvent::Error.as_str(), payload, None);
        self.mark_errored_and_schedule();
    }

    fn close_channel(self: &Arc<Self>, reason: &str) {
        debug!(topic = %self.topic, reason, "channel closed");
        self.rejoin_timer.reset();
        if let Some(join_push) = self
            .join_push
            .lock()
            .expect("channel lock poisoned")
            .clone()
        {
            join_push.cancel_timeout();
        }
        *self.state.lock().expect("channel lock poisoned") = ChannelState::Closed;

        let payload = json!({ "reason": reason });
        self.dispatch(ControlEvent::Close.as_str(), &payload, None);

        self.bindings
            .lock()
            .expect("channel lock poisoned")
            .clear();
        self.push_buffer
            .lock()
            .expect("channel lock poisoned")
            .clear();
        if let Some(socket) = self.socket.upgrade() {
            socket.remove_channel(self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("join_ref", &self.join_ref())
            .finish_non_exhaustive()
    }
}
