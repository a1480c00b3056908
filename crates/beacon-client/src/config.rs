//! Socket configuration.
//!
//! All settings are programmatic; construct a [`SocketConfig`], override what
//! you need, and hand it to [`Socket::new`](crate::Socket::new).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_protocol::{JsonSerializer, Serializer};
use beacon_transport::{LongPollConfig, TransportKind};
use serde_json::Value;

/// A delay policy: maps a try count (starting at 1) to a delay.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A lazily-evaluated parameter/payload producer, re-invoked at the moment of
/// use so per-attempt values (e.g. refreshed auth tokens) stay current.
pub type ParamsFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Socket configuration.
pub struct SocketConfig {
    /// Which wire transport to use.
    pub transport: TransportKind,

    /// Envelope serializer shared by both directions.
    pub serializer: Arc<dyn Serializer>,

    /// Keepalive interval. `Duration::ZERO` disables heartbeats.
    pub heartbeat_interval: Duration,

    /// Delay table for reconnect attempts after a transport loss.
    pub reconnect_after: DelayFn,

    /// Delay table for per-channel rejoin attempts.
    pub rejoin_after: DelayFn,

    /// Default timeout for joins and pushes.
    pub timeout: Duration,

    /// Extra handshake params appended to the endpoint URL.
    pub params: Value,

    /// Long-poll transport settings (ignored for websocket).
    pub longpoll: LongPollConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            serializer: Arc::new(JsonSerializer),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_after: Arc::new(default_reconnect_after),
            rejoin_after: Arc::new(default_rejoin_after),
            timeout: Duration::from_secs(10),
            params: Value::Object(serde_json::Map::new()),
            longpoll: LongPollConfig::default(),
        }
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConfig")
            .field("transport", &self.transport)
            .field("serializer", &self.serializer.name())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("timeout", &self.timeout)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Default reconnect delay table: fast early retries, saturating at 5s.
#[must_use]
pub fn default_reconnect_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    STEPS_MS
        .get(tries.saturating_sub(1) as usize)
        .map_or(Duration::from_secs(5), |ms| Duration::from_millis(*ms))
}

/// Default rejoin delay table: 1s, 2s, 5s, then 10s.
#[must_use]
pub fn default_rejoin_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 3] = [1000, 2000, 5000];
    STEPS_MS
        .get(tries.saturating_sub(1) as usize)
        .map_or(Duration::from_secs(10), |ms| Duration::from_millis(*ms))
}
