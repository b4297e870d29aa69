//! Transport capability seam. The core never implements a broker protocol;
//! it consumes a `Transport` that produces `Adapter` handles and delivers
//! inbound traffic through `AdapterEvents` on transport-owned threads.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AdapterError, StartError};
use crate::protocol::{LinkState, NoticeEnvelope, RequestEnvelope, ResponseEnvelope};

/// Connection parameters handed to a transport.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Composed module identity (`name.device_code`) used for addressing.
    pub client_id: String,
    pub addr: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout the transport should apply to its own retries.
    pub timeout: Duration,
    pub retry: u32,
    /// Transports may append a random suffix to their broker client identity;
    /// the addressing identity stays `client_id` either way.
    pub random_client_id: bool,
    pub sync_mode: bool,
}

/// Callbacks the runtime registers at connect time. Invoked on threads owned
/// by the transport; implementations must not block them longer than needed.
#[derive(Clone)]
pub struct AdapterEvents {
    pub on_status_changed: Arc<dyn Fn(LinkState) + Send + Sync>,
    pub on_request: Arc<dyn Fn(RequestEnvelope) -> ResponseEnvelope + Send + Sync>,
    pub on_notice: Arc<dyn Fn(NoticeEnvelope) + Send + Sync>,
    pub on_retain_notice: Arc<dyn Fn(NoticeEnvelope) + Send + Sync>,
    pub on_exiting: Arc<dyn Fn() + Send + Sync>,
    pub on_get_version: Arc<dyn Fn() -> Vec<String> + Send + Sync>,
}

/// A live connection. All methods are callable from any thread.
pub trait Adapter: Send + Sync {
    /// Send a request and block until a response or the timeout. Never hangs
    /// past `timeout`: an unreachable peer yields a `Timeout`/`UnLinked`
    /// response envelope rather than an indefinite wait.
    fn request(
        &self,
        target: &str,
        route: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> ResponseEnvelope;

    fn send_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError>;

    /// Notice whose last value the transport retains for late subscribers.
    fn send_retain_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError>;

    /// Close the connection. Pending requests fail promptly rather than hang.
    fn stop(&self);
}

/// Factory for adapters; injected into the runtime so it can rebuild the
/// connection on Reset without knowing the transport.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        opts: ConnectOptions,
        events: AdapterEvents,
    ) -> Result<Arc<dyn Adapter>, StartError>;
}
