//! In-process mock transport for runtime tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::adapter::{Adapter, AdapterEvents, ConnectOptions, Transport};
use crate::context::json_payload;
use crate::error::{AdapterError, StartError};
use crate::protocol::{routes, LinkState, RequestEnvelope, ResponseCode, ResponseEnvelope};

#[derive(Clone, Copy)]
enum LinkBehavior {
    Never,
    Immediate,
    After(Duration),
}

#[derive(Default)]
struct MockShared {
    events: Mutex<Option<AdapterEvents>>,
    knock_reply: Mutex<Option<HashMap<String, String>>>,
    parent_reply: Mutex<Option<String>>,
    sent: Mutex<Vec<RequestEnvelope>>,
    connects: AtomicUsize,
}

impl MockShared {
    fn answer(&self, req: &RequestEnvelope) -> ResponseEnvelope {
        self.sent.lock().unwrap().push(req.clone());
        match req.route.as_str() {
            routes::KNOCK_DOOR => match self.knock_reply.lock().unwrap().clone() {
                Some(table) => ResponseEnvelope::success(req, json_payload(&table)),
                None => ResponseEnvelope::failure(req, ResponseCode::RouteNotFind, "no registry"),
            },
            routes::SERVER_DEV_ID => match self.parent_reply.lock().unwrap().clone() {
                Some(parent) => ResponseEnvelope::success(req, parent.into_bytes()),
                None => ResponseEnvelope::failure(req, ResponseCode::RouteNotFind, "no registry"),
            },
            _ => ResponseEnvelope::success(req, Vec::new()),
        }
    }
}

/// Scriptable transport: records every outbound request, answers registry
/// routes from scripted replies, and lets tests drive link-state changes.
pub struct MockTransport {
    behavior: LinkBehavior,
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn never_links() -> Arc<Self> {
        Arc::new(Self::with_behavior(LinkBehavior::Never))
    }

    pub fn linked() -> Arc<Self> {
        Arc::new(Self::with_behavior(LinkBehavior::Immediate))
    }

    pub fn links_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self::with_behavior(LinkBehavior::After(delay)))
    }

    fn with_behavior(behavior: LinkBehavior) -> Self {
        Self {
            behavior,
            shared: Arc::new(MockShared::default()),
        }
    }

    pub fn script_knock(&self, table: HashMap<String, String>) {
        *self.shared.knock_reply.lock().unwrap() = Some(table);
    }

    pub fn script_parent(&self, parent: &str) {
        *self.shared.parent_reply.lock().unwrap() = Some(parent.to_string());
    }

    /// Drive a link-state change through the most recent connection's events.
    pub fn set_state(&self, state: LinkState) {
        let events = self.shared.events.lock().unwrap().clone();
        if let Some(events) = events {
            (events.on_status_changed)(state);
        }
    }

    /// Deliver an inbound request and return the module's response.
    pub fn push_request(&self, req: RequestEnvelope) -> Option<ResponseEnvelope> {
        let events = self.shared.events.lock().unwrap().clone();
        events.map(|e| (e.on_request)(req))
    }

    pub fn sent_requests(&self) -> Vec<RequestEnvelope> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        opts: ConnectOptions,
        events: AdapterEvents,
    ) -> Result<Arc<dyn Adapter>, StartError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        *self.shared.events.lock().unwrap() = Some(events.clone());
        match self.behavior {
            LinkBehavior::Never => {}
            LinkBehavior::Immediate => (events.on_status_changed)(LinkState::Linked),
            LinkBehavior::After(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    (events.on_status_changed)(LinkState::Linked);
                });
            }
        }
        Ok(Arc::new(MockAdapter {
            shared: Arc::clone(&self.shared),
            client_id: opts.client_id,
        }))
    }
}

struct MockAdapter {
    shared: Arc<MockShared>,
    client_id: String,
}

impl Adapter for MockAdapter {
    fn request(
        &self,
        target: &str,
        route: &str,
        payload: &[u8],
        _timeout: Duration,
    ) -> ResponseEnvelope {
        let req = RequestEnvelope::new(&self.client_id, target, route, payload);
        self.shared.answer(&req)
    }

    fn send_notice(&self, _route: &str, _payload: &[u8]) -> Result<(), AdapterError> {
        Ok(())
    }

    fn send_retain_notice(&self, _route: &str, _payload: &[u8]) -> Result<(), AdapterError> {
        Ok(())
    }

    fn stop(&self) {}
}
