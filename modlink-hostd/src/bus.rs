//! In-process broker bus.
//!
//! Stands in for an external broker: endpoints register under their qualified
//! identity, requests are delivered point-to-point with a timeout, notices are
//! broadcast, retained notices replay to late joiners. Link loss can be
//! injected per endpoint, which is how reconnect behavior gets tested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use modlink_core::adapter::{Adapter, AdapterEvents, ConnectOptions, Transport};
use modlink_core::error::{AdapterError, StartError};
use modlink_core::protocol::{
    LinkState, NoticeEnvelope, RequestEnvelope, ResponseCode, ResponseEnvelope,
};

#[derive(Clone)]
struct Endpoint {
    events: AdapterEvents,
    linked: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    retained: Mutex<HashMap<String, NoticeEnvelope>>,
}

/// Cheap-clone handle; all clones share one bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Simulate a broker-side link loss for one endpoint.
    pub fn drop_link(&self, client_id: &str) {
        if let Some(endpoint) = self.endpoint(client_id) {
            endpoint.linked.store(false, Ordering::SeqCst);
            (endpoint.events.on_status_changed)(LinkState::LinkLost);
        }
    }

    /// Bring a dropped endpoint back and replay retained notices to it.
    pub fn relink(&self, client_id: &str) {
        if let Some(endpoint) = self.endpoint(client_id) {
            endpoint.linked.store(true, Ordering::SeqCst);
            (endpoint.events.on_status_changed)(LinkState::Linked);
            self.replay_retained(&endpoint);
        }
    }

    pub fn connected(&self, client_id: &str) -> bool {
        self.endpoint(client_id)
            .map(|e| e.linked.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn endpoint(&self, client_id: &str) -> Option<Endpoint> {
        self.inner
            .endpoints
            .lock()
            .ok()
            .and_then(|map| map.get(client_id).cloned())
    }

    /// Exact identity first, then any endpoint with a matching module name.
    fn resolve(&self, target: &str) -> Option<Endpoint> {
        let map = self.inner.endpoints.lock().ok()?;
        if let Some(endpoint) = map.get(target) {
            return Some(endpoint.clone());
        }
        let (name, _) = modlink_core::address::resolve(target);
        map.iter()
            .find(|(id, _)| modlink_core::address::resolve(id).0 == name)
            .map(|(_, e)| e.clone())
    }

    fn replay_retained(&self, endpoint: &Endpoint) {
        let retained: Vec<NoticeEnvelope> = match self.inner.retained.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return,
        };
        let events = endpoint.events.clone();
        thread::spawn(move || {
            for notice in retained {
                (events.on_retain_notice)(notice);
            }
        });
    }

    fn broadcast(&self, from: &str, notice: NoticeEnvelope, retained: bool) {
        if retained {
            if let Ok(mut map) = self.inner.retained.lock() {
                map.insert(notice.route.clone(), notice.clone());
            }
        }
        let targets: Vec<Endpoint> = match self.inner.endpoints.lock() {
            Ok(map) => map
                .iter()
                .filter(|(id, e)| id.as_str() != from && e.linked.load(Ordering::SeqCst))
                .map(|(_, e)| e.clone())
                .collect(),
            Err(_) => return,
        };
        thread::spawn(move || {
            for endpoint in targets {
                if retained {
                    (endpoint.events.on_retain_notice)(notice.clone());
                } else {
                    (endpoint.events.on_notice)(notice.clone());
                }
            }
        });
    }
}

impl Transport for LocalBus {
    fn connect(
        &self,
        opts: ConnectOptions,
        events: AdapterEvents,
    ) -> Result<Arc<dyn Adapter>, StartError> {
        let endpoint = Endpoint {
            events: events.clone(),
            linked: Arc::new(AtomicBool::new(true)),
        };
        match self.inner.endpoints.lock() {
            Ok(mut map) => {
                map.insert(opts.client_id.clone(), endpoint.clone());
            }
            Err(_) => return Err(StartError::Connect("bus poisoned".to_string())),
        }
        debug!("bus: {} connected", opts.client_id);
        (events.on_status_changed)(LinkState::Linked);
        self.replay_retained(&endpoint);
        Ok(Arc::new(BusAdapter {
            bus: self.clone(),
            client_id: opts.client_id,
        }))
    }
}

struct BusAdapter {
    bus: LocalBus,
    client_id: String,
}

impl Adapter for BusAdapter {
    fn request(
        &self,
        target: &str,
        route: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> ResponseEnvelope {
        let Some(endpoint) = self.bus.resolve(target) else {
            return ResponseEnvelope::orphan(ResponseCode::Timeout, "no such endpoint");
        };
        if !endpoint.linked.load(Ordering::SeqCst) {
            return ResponseEnvelope::orphan(ResponseCode::Timeout, "endpoint unreachable");
        }
        let req = RequestEnvelope::new(&self.client_id, target, route, payload);
        let (tx, rx) = mpsc::channel();
        let events = endpoint.events.clone();
        thread::spawn(move || {
            let _ = tx.send((events.on_request)(req));
        });
        match rx.recv_timeout(timeout) {
            Ok(resp) => resp,
            Err(_) => ResponseEnvelope::orphan(ResponseCode::Timeout, "request timeout"),
        }
    }

    fn send_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError> {
        let notice = NoticeEnvelope::new(&self.client_id, route, payload);
        self.bus.broadcast(&self.client_id, notice, false);
        Ok(())
    }

    fn send_retain_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError> {
        let notice = NoticeEnvelope::new(&self.client_id, route, payload);
        self.bus.broadcast(&self.client_id, notice, true);
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut map) = self.bus.inner.endpoints.lock() {
            map.remove(&self.client_id);
        }
        debug!("bus: {} disconnected", self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn events_with_reply(reply: &'static [u8], notices: Arc<AtomicUsize>) -> AdapterEvents {
        AdapterEvents {
            on_status_changed: Arc::new(|_| {}),
            on_request: Arc::new(move |req| ResponseEnvelope::success(&req, reply.to_vec())),
            on_notice: {
                let n = Arc::clone(&notices);
                Arc::new(move |_| {
                    n.fetch_add(1, Ordering::SeqCst);
                })
            },
            on_retain_notice: Arc::new(move |_| {
                notices.fetch_add(1, Ordering::SeqCst);
            }),
            on_exiting: Arc::new(|| {}),
            on_get_version: Arc::new(Vec::new),
        }
    }

    fn connect(bus: &LocalBus, client_id: &str, reply: &'static [u8]) -> (Arc<dyn Adapter>, Arc<AtomicUsize>) {
        let notices = Arc::new(AtomicUsize::new(0));
        let opts = ConnectOptions {
            client_id: client_id.to_string(),
            addr: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_millis(500),
            retry: 0,
            random_client_id: false,
            sync_mode: false,
        };
        let adapter = bus
            .connect(opts, events_with_reply(reply, Arc::clone(&notices)))
            .unwrap();
        (adapter, notices)
    }

    #[test]
    fn request_routes_exact_and_by_name() {
        let bus = LocalBus::new();
        let (a, _) = connect(&bus, "Alpha.devA", b"from-alpha");
        let (_b, _) = connect(&bus, "Beta.devA", b"from-beta");

        let resp = a.request("Beta.devA", "Run", b"{}", Duration::from_millis(500));
        assert!(resp.code.is_success());
        assert_eq!(resp.payload, b"from-beta");

        // Wrong device still reaches the only endpoint with that name.
        let resp = a.request("Beta.devZ", "Run", b"{}", Duration::from_millis(500));
        assert!(resp.code.is_success());
    }

    #[test]
    fn missing_endpoint_times_out() {
        let bus = LocalBus::new();
        let (a, _) = connect(&bus, "Alpha.devA", b"");
        let resp = a.request("Ghost.devA", "Run", b"{}", Duration::from_millis(100));
        assert_eq!(resp.code, ResponseCode::Timeout);
    }

    #[test]
    fn dropped_endpoint_is_unreachable_until_relink() {
        let bus = LocalBus::new();
        let (a, _) = connect(&bus, "Alpha.devA", b"");
        let (_b, _) = connect(&bus, "Beta.devA", b"pong");
        bus.drop_link("Beta.devA");
        let resp = a.request("Beta.devA", "Run", b"{}", Duration::from_millis(100));
        assert_eq!(resp.code, ResponseCode::Timeout);
        bus.relink("Beta.devA");
        let resp = a.request("Beta.devA", "Run", b"{}", Duration::from_millis(500));
        assert!(resp.code.is_success());
    }

    #[test]
    fn notices_broadcast_to_everyone_else() {
        let bus = LocalBus::new();
        let (a, a_notices) = connect(&bus, "Alpha.devA", b"");
        let (_b, b_notices) = connect(&bus, "Beta.devA", b"");
        a.send_notice("Tick", b"{}").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(b_notices.load(Ordering::SeqCst), 1);
        assert_eq!(a_notices.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retained_notice_replays_to_late_joiner() {
        let bus = LocalBus::new();
        let (a, _) = connect(&bus, "Alpha.devA", b"");
        a.send_retain_notice("LastValue", b"{\"v\":1}").unwrap();
        thread::sleep(Duration::from_millis(50));
        let (_b, b_notices) = connect(&bus, "Beta.devA", b"");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(b_notices.load(Ordering::SeqCst), 1);
    }
}
