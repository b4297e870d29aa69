//! Module runtime: lifecycle, link tracking, discovery, heartbeat, sending.
//!
//! A `Module` owns one adapter at a time. Start connects, waits for the link
//! (bounded or indefinite), knocks the registry door, and arms the heartbeat;
//! Stop tears all of that down exactly once. Reset rebuilds the connection
//! under a new device code without losing the registered handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::adapter::{Adapter, AdapterEvents, ConnectOptions, Transport};
use crate::address;
use crate::context::json_payload;
use crate::dispatch::Dispatcher;
use crate::error::{RequestError, StartError};
use crate::protocol::{routes, LinkState, RequestEnvelope, ResponseCode, ResponseEnvelope};
use crate::routes::{
    heart_payload, knock_door, query_parent_device, registry_target, should_knock, RouteTable,
};
use crate::setting::{Handlers, Setting, SettingStore};

const HEART_INTERVAL: Duration = Duration::from_secs(10);
/// Delay between answering `Exit` and actually stopping, so the reply
/// leaves before the connection goes down.
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Handle to a running module. Cheap to clone; all clones drive the same
/// runtime.
#[derive(Clone)]
pub struct Module {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    setting: RwLock<Setting>,
    handlers: Handlers,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SettingStore>,
    adapter: Mutex<Option<Arc<dyn Adapter>>>,
    state: Mutex<LinkState>,
    /// One-shot completion for the start-time link wait. Taken under the lock
    /// so the signal fires at most once per connect.
    link_wait_tx: Mutex<Option<mpsc::Sender<()>>>,
    routes: RouteTable,
    parent_device: Mutex<String>,
    was_linked: AtomicBool,
    stopped: AtomicBool,
    heart_stop: Mutex<Option<mpsc::Sender<()>>>,
    heart_join: Mutex<Option<JoinHandle<()>>>,
}

impl Module {
    /// Start a module: connect, wait for the link, announce to the registry.
    ///
    /// Collaborators are injected; nothing here touches process-global state.
    pub fn start(
        setting: Setting,
        handlers: Handlers,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SettingStore>,
    ) -> Result<Module, StartError> {
        let mut setting = setting;
        match store.load(&setting.module) {
            Ok(Some(saved)) if setting.device_code.is_empty() => {
                setting.device_code = saved.device_code;
                setting.device_name = saved.device_name;
            }
            Ok(_) => {}
            Err(err) => warn!("[{}] setting load failed: {err}", setting.module),
        }

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let exit_weak = weak.clone();
            let dispatcher = Dispatcher::new(
                &setting,
                handlers.clone(),
                Arc::new(move || {
                    let weak = exit_weak.clone();
                    thread::spawn(move || {
                        thread::sleep(EXIT_GRACE);
                        if let Some(inner) = weak.upgrade() {
                            inner.shutdown();
                        }
                    });
                }),
            );
            Inner {
                setting: RwLock::new(setting),
                handlers,
                dispatcher,
                transport,
                store,
                adapter: Mutex::new(None),
                state: Mutex::new(LinkState::Connecting),
                link_wait_tx: Mutex::new(None),
                routes: RouteTable::new(),
                parent_device: Mutex::new(String::new()),
                was_linked: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                heart_stop: Mutex::new(None),
                heart_join: Mutex::new(None),
            }
        });

        inner.connect()?;
        inner.initial_discovery();
        // Init code runs against a connected, discovered runtime.
        if let Some(on_init) = &inner.handlers.on_init {
            on_init();
        }
        inner.persist_setting();
        info!("[{}] started as {}", inner.module_name(), inner.client_id());
        Ok(Module { inner })
    }

    /// Qualified identity this module is addressed by.
    pub fn client_id(&self) -> String {
        self.inner.client_id()
    }

    pub fn state(&self) -> LinkState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(LinkState::Fault)
    }

    pub fn setting(&self) -> Setting {
        self.inner.snapshot_setting()
    }

    /// Send a request and wait for the reply payload.
    ///
    /// Bare module names are resolved through the route table (falling back to
    /// the local device); a target containing `/` is handed to the registry
    /// for forwarding.
    pub fn send_request(
        &self,
        target: &str,
        route: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RequestError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(RequestError::new(ResponseCode::UnLinked, "module stopped"));
        }
        let adapter = inner
            .current_adapter()
            .ok_or_else(|| RequestError::new(ResponseCode::UnLinked, "not linked"))?;
        let setting = inner.snapshot_setting();
        let timeout = setting.request_timeout();

        let resp = if address::is_forwarded(target) {
            // Registry-forwarded: wrap the real request, let `Route` deliver.
            let wrapped = RequestEnvelope::new(&setting.client_id(), target, route, payload);
            let parent = inner.snapshot_parent();
            let registry = registry_target(&setting.device_code, &parent);
            adapter.request(&registry, routes::FORWARD, &json_payload(&wrapped), timeout)
        } else {
            let to = inner.routes.target_for(target, &setting.device_code);
            adapter.request(&to, route, payload, timeout)
        };

        if resp.code.is_success() {
            Ok(resp.payload)
        } else {
            Err(RequestError::from_response(&resp))
        }
    }

    pub fn send_notice(&self, route: &str, payload: &[u8]) -> Result<(), RequestError> {
        let adapter = self
            .inner
            .current_adapter()
            .ok_or_else(|| RequestError::new(ResponseCode::UnLinked, "not linked"))?;
        adapter
            .send_notice(route, payload)
            .map_err(|e| RequestError::error(e.to_string()))
    }

    pub fn send_retain_notice(&self, route: &str, payload: &[u8]) -> Result<(), RequestError> {
        let adapter = self
            .inner
            .current_adapter()
            .ok_or_else(|| RequestError::new(ResponseCode::UnLinked, "not linked"))?;
        adapter
            .send_retain_notice(route, payload)
            .map_err(|e| RequestError::error(e.to_string()))
    }

    /// Reassign the device code and rebuild the connection. Handlers and the
    /// module identity survive; the route table and link history do not.
    pub fn reset(&self, device_code: &str, device_name: &str) -> Result<(), StartError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(StartError::Stopped);
        }
        inner.stop_heart();
        if let Ok(mut slot) = inner.adapter.lock() {
            if let Some(adapter) = slot.take() {
                adapter.stop();
            }
        }
        inner.routes.clear();
        inner.was_linked.store(false, Ordering::SeqCst);
        if let Ok(mut setting) = inner.setting.write() {
            setting.device_code = device_code.to_string();
            setting.device_name = device_name.to_string();
        }
        inner.connect()?;
        inner.initial_discovery();
        inner.persist_setting();
        info!("[{}] reset to {}", inner.module_name(), inner.client_id());
        Ok(())
    }

    /// Stop the module. Idempotent; `on_stop` fires at most once.
    pub fn stop(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn module_name(&self) -> String {
        self.setting
            .read()
            .map(|s| s.module.clone())
            .unwrap_or_default()
    }

    fn client_id(&self) -> String {
        self.setting
            .read()
            .map(|s| s.client_id())
            .unwrap_or_default()
    }

    fn snapshot_setting(&self) -> Setting {
        match self.setting.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn snapshot_parent(&self) -> String {
        self.parent_device
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn current_adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.adapter.lock().ok().and_then(|slot| slot.clone())
    }

    fn connect(self: &Arc<Self>) -> Result<(), StartError> {
        let setting = self.snapshot_setting();
        self.transition(LinkState::Connecting);

        let (tx, rx) = mpsc::channel();
        if let Ok(mut slot) = self.link_wait_tx.lock() {
            *slot = Some(tx);
        }

        let opts = ConnectOptions {
            client_id: setting.client_id(),
            addr: setting.broker.addr.clone(),
            username: setting.broker.username.clone(),
            password: setting.broker.password.clone(),
            timeout: setting.request_timeout(),
            retry: setting.broker.retry,
            random_client_id: setting.broker.random_client_id,
            sync_mode: setting.sync_dispatch,
        };
        let adapter = self.transport.connect(opts, self.events())?;
        if let Ok(mut slot) = self.adapter.lock() {
            *slot = Some(adapter);
        }

        // Sender side is dropped on Linked and on shutdown, so both bound
        // waits and indefinite ones return promptly.
        match setting.link_wait() {
            Some(limit) => {
                if rx.recv_timeout(limit).is_err() {
                    debug!("[{}] link wait elapsed, continuing", setting.module);
                }
            }
            None => {
                let _ = rx.recv();
            }
        }
        Ok(())
    }

    fn events(self: &Arc<Self>) -> AdapterEvents {
        let weak = Arc::downgrade(self);
        let status = weak.clone();
        let request = weak.clone();
        let notice = weak.clone();
        let retain = weak.clone();
        let exiting = weak.clone();
        AdapterEvents {
            on_status_changed: Arc::new(move |state| {
                if let Some(inner) = status.upgrade() {
                    inner.handle_state(state);
                }
            }),
            on_request: Arc::new(move |req| match request.upgrade() {
                Some(inner) => inner.dispatcher.dispatch_request(&req),
                None => ResponseEnvelope::failure(&req, ResponseCode::UnLinked, "module stopped"),
            }),
            on_notice: Arc::new(move |n| {
                if let Some(inner) = notice.upgrade() {
                    inner.dispatcher.dispatch_notice(&n, false);
                }
            }),
            on_retain_notice: Arc::new(move |n| {
                if let Some(inner) = retain.upgrade() {
                    inner.dispatcher.dispatch_notice(&n, true);
                }
            }),
            on_exiting: Arc::new(move || {
                if let Some(inner) = exiting.upgrade() {
                    inner.shutdown();
                }
            }),
            on_get_version: Arc::new(move || match weak.upgrade() {
                Some(inner) => inner.dispatcher.versions(),
                None => Vec::new(),
            }),
        }
    }

    fn handle_state(self: &Arc<Self>, state: LinkState) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut current) = self.state.lock() {
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("[{}] link state: {state}", self.module_name());
        if let Some(on_state) = &self.handlers.on_state {
            on_state(state);
        }
        if state == LinkState::Linked {
            if let Ok(mut slot) = self.link_wait_tx.lock() {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(());
                }
            }
            // A relink after a link loss means the registry may have restarted;
            // refresh the table off the adapter callback thread.
            if self.was_linked.swap(true, Ordering::SeqCst) {
                let weak = Arc::downgrade(self);
                thread::spawn(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.refresh_discovery();
                    }
                });
            }
        }
    }

    fn initial_discovery(self: &Arc<Self>) {
        let setting = self.snapshot_setting();
        if !should_knock(&setting) {
            return;
        }
        self.refresh_discovery();
        self.start_heart();
    }

    fn refresh_discovery(&self) {
        let setting = self.snapshot_setting();
        if !should_knock(&setting) {
            return;
        }
        let Some(adapter) = self.current_adapter() else {
            return;
        };
        let timeout = setting.request_timeout();

        match query_parent_device(adapter.as_ref(), &setting, timeout) {
            Ok(parent) => {
                if let Ok(mut slot) = self.parent_device.lock() {
                    *slot = parent;
                }
            }
            Err(err) => warn!("[{}] parent device query failed: {err}", setting.module),
        }

        let parent = self.snapshot_parent();
        match knock_door(adapter.as_ref(), &setting, &parent, timeout) {
            Ok(table) => {
                debug!("[{}] knock-door: {} routes", setting.module, table.len());
                self.routes.replace(table);
            }
            Err(err) => warn!("[{}] knock-door failed: {err}", setting.module),
        }
    }

    fn start_heart(self: &Arc<Self>) {
        let mut stop_slot = match self.heart_stop.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if stop_slot.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        *stop_slot = Some(tx);
        drop(stop_slot);

        let weak = Arc::downgrade(self);
        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(HEART_INTERVAL) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.send_heart();
        });
        if let Ok(mut join) = self.heart_join.lock() {
            *join = Some(handle);
        }
    }

    fn stop_heart(&self) {
        if let Ok(mut slot) = self.heart_stop.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
        if let Ok(mut join) = self.heart_join.lock() {
            if let Some(handle) = join.take() {
                let _ = handle.join();
            }
        }
    }

    fn send_heart(&self) {
        let Some(adapter) = self.current_adapter() else {
            return;
        };
        let setting = self.snapshot_setting();
        let parent = self.snapshot_parent();
        let target = registry_target(&setting.device_code, &parent);
        let payload = heart_payload(&setting.device_code, &setting.module);
        let resp = adapter.request(&target, routes::HEART, &payload, setting.request_timeout());
        if !resp.code.is_success() {
            debug!("[{}] heart not acked: {}", setting.module, resp.code);
        }
    }

    fn persist_setting(&self) {
        let setting = self.snapshot_setting();
        if let Err(err) = self.store.save(&setting) {
            warn!("[{}] setting save failed: {err}", setting.module);
        }
    }

    fn transition(self: &Arc<Self>, state: LinkState) {
        self.handle_state(state);
    }

    fn shutdown(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] stopping", self.module_name());
        self.stop_heart();
        if let Ok(mut slot) = self.adapter.lock() {
            if let Some(adapter) = slot.take() {
                adapter.stop();
            }
        }
        // Unblock a start still waiting on the link.
        if let Ok(mut slot) = self.link_wait_tx.lock() {
            slot.take();
        }
        let changed = match self.state.lock() {
            Ok(mut current) => {
                let changed = *current != LinkState::Stopped;
                *current = LinkState::Stopped;
                changed
            }
            Err(_) => false,
        };
        if changed {
            if let Some(on_state) = &self.handlers.on_state {
                on_state(LinkState::Stopped);
            }
        }
        if let Some(on_stop) = &self.handlers.on_stop {
            on_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::NullStore;
    use crate::testutil::MockTransport;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn plain_setting(link_wait_ms: u64) -> Setting {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut s = Setting::new("Backup", "backup module", "1.0.0");
        s.broker.link_wait_ms = link_wait_ms;
        s
    }

    #[test]
    fn bounded_link_wait_returns_within_limit() {
        let transport = MockTransport::never_links();
        let started = Instant::now();
        let module = Module::start(
            plain_setting(200),
            Handlers::new(),
            transport,
            Arc::new(NullStore),
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(module.state(), LinkState::Connecting);
        module.stop();
    }

    #[test]
    fn indefinite_link_wait_returns_promptly_on_link() {
        let transport = MockTransport::links_after(Duration::from_millis(150));
        let started = Instant::now();
        let module = Module::start(
            plain_setting(0),
            Handlers::new(),
            transport,
            Arc::new(NullStore),
        )
        .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(module.state(), LinkState::Linked);
        module.stop();
    }

    #[test]
    fn knock_door_populates_route_table() {
        let transport = MockTransport::linked();
        transport.script_knock(HashMap::from([(
            "Backup".to_string(),
            "dev02".to_string(),
        )]));
        transport.script_parent("root");
        let setting = plain_setting(500).with_device("dev01", "rack 1");
        let module = Module::start(setting, Handlers::new(), transport.clone(), Arc::new(NullStore))
            .unwrap();

        // Route table resolves the peer's device; unknowns stay local.
        let _ = module.send_request("Backup", "Run", b"{}");
        let _ = module.send_request("Other", "Run", b"{}");
        let sent = transport.sent_requests();
        assert!(sent.iter().any(|r| r.to == "Backup.dev02" && r.route == "Run"));
        assert!(sent.iter().any(|r| r.to == "Other.dev01"));
        module.stop();
    }

    #[test]
    fn temp_device_skips_discovery() {
        let transport = MockTransport::linked();
        let setting = plain_setting(500).with_device("dev01[TEMP]", "");
        let module = Module::start(setting, Handlers::new(), transport.clone(), Arc::new(NullStore))
            .unwrap();
        let sent = transport.sent_requests();
        assert!(sent.iter().all(|r| r.route != routes::KNOCK_DOOR));
        module.stop();
    }

    #[test]
    fn relink_refreshes_route_table() {
        let transport = MockTransport::linked();
        transport.script_knock(HashMap::from([(
            "Backup".to_string(),
            "dev02".to_string(),
        )]));
        transport.script_parent("root");
        let setting = plain_setting(500).with_device("dev01", "");
        let module = Module::start(setting, Handlers::new(), transport.clone(), Arc::new(NullStore))
            .unwrap();

        transport.script_knock(HashMap::from([(
            "Backup".to_string(),
            "dev03".to_string(),
        )]));
        transport.set_state(LinkState::LinkLost);
        transport.set_state(LinkState::Linked);
        // Refresh runs off the callback thread.
        thread::sleep(Duration::from_millis(100));

        let _ = module.send_request("Backup", "Run", b"{}");
        let sent = transport.sent_requests();
        assert!(sent.iter().any(|r| r.to == "Backup.dev03"));
        module.stop();
    }

    #[test]
    fn init_runs_after_link_and_discovery() {
        let transport = MockTransport::linked();
        transport.script_knock(HashMap::from([(
            "Backup".to_string(),
            "dev02".to_string(),
        )]));
        transport.script_parent("root");
        let knocked_at_init = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&knocked_at_init);
        let probe_transport = transport.clone();
        let setting = plain_setting(500).with_device("dev01", "");
        let module = Module::start(
            setting,
            Handlers::new().on_init(move || {
                let knocked = probe_transport
                    .sent_requests()
                    .iter()
                    .any(|r| r.route == routes::KNOCK_DOOR);
                observed.store(knocked, Ordering::SeqCst);
            }),
            transport,
            Arc::new(NullStore),
        )
        .unwrap();
        assert!(knocked_at_init.load(Ordering::SeqCst));
        module.stop();
    }

    #[test]
    fn inbound_request_dispatches_through_runtime_events() {
        let transport = MockTransport::linked();
        let module = Module::start(
            plain_setting(500),
            Handlers::new().on_request(|route, _ctx| match route {
                "Ping" => Ok(b"pong".to_vec()),
                _ => Err(RequestError::route_not_find()),
            }),
            transport.clone(),
            Arc::new(NullStore),
        )
        .unwrap();
        let resp = transport
            .push_request(RequestEnvelope::new("Peer", "Backup", "Ping", b"{}"))
            .unwrap();
        assert!(resp.code.is_success());
        assert_eq!(resp.payload, b"pong");
        let resp = transport
            .push_request(RequestEnvelope::new("Peer", "Backup", "Nope", b"{}"))
            .unwrap();
        assert_eq!(resp.code, ResponseCode::RouteNotFind);
        module.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let stops = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&stops);
        let transport = MockTransport::linked();
        let module = Module::start(
            plain_setting(500),
            Handlers::new().on_stop(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            transport,
            Arc::new(NullStore),
        )
        .unwrap();
        module.stop();
        module.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(module.state(), LinkState::Stopped);
    }

    #[test]
    fn send_after_stop_is_unlinked() {
        let transport = MockTransport::linked();
        let module = Module::start(
            plain_setting(500),
            Handlers::new(),
            transport,
            Arc::new(NullStore),
        )
        .unwrap();
        module.stop();
        let err = module.send_request("Backup", "Run", b"{}").unwrap_err();
        assert_eq!(err.code, ResponseCode::UnLinked);
    }

    #[test]
    fn forwarded_target_goes_through_registry() {
        let transport = MockTransport::linked();
        transport.script_parent("root");
        let setting = plain_setting(500).with_device("dev01", "");
        let module = Module::start(setting, Handlers::new(), transport.clone(), Arc::new(NullStore))
            .unwrap();
        let _ = module.send_request("Backup/plant_line3", "Run", b"{}");
        let sent = transport.sent_requests();
        assert!(sent
            .iter()
            .any(|r| r.to == "Route.dev01" && r.route == routes::FORWARD));
        module.stop();
    }

    #[test]
    fn reset_reconnects_under_new_device() {
        let transport = MockTransport::linked();
        transport.script_parent("root");
        let setting = plain_setting(500).with_device("dev01", "");
        let module = Module::start(setting, Handlers::new(), transport.clone(), Arc::new(NullStore))
            .unwrap();
        module.reset("dev09", "moved rack").unwrap();
        assert_eq!(module.client_id(), "Backup.dev09");
        assert!(transport.connect_count() >= 2);
        module.stop();
        assert!(matches!(module.reset("dev10", ""), Err(StartError::Stopped)));
    }
}
