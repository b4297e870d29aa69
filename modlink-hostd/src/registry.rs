//! The `Route` registry module: knock-door intake, module list, heartbeats.
//!
//! State is a device table keyed by device id. Knock-door upserts the caller's
//! record and replies with the current module-to-device map; heartbeats keep
//! entries alive, and entries that miss three heartbeat intervals are pruned
//! lazily on the next access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use modlink_core::adapter::Transport;
use modlink_core::address;
use modlink_core::context::json_payload;
use modlink_core::error::{RequestError, StartError};
use modlink_core::protocol::{
    routes, DiscoveryRecord, ModuleInfo, RequestEnvelope, ResponseCode, ROUTE_MODULE,
};
use modlink_core::runtime::Module;
use modlink_core::setting::{Handlers, Setting, SettingStore};
use serde::{Deserialize, Serialize};

/// Entries older than this are considered gone (three heartbeat intervals).
const STALE_AFTER: Duration = Duration::from_secs(30);

struct ModuleEntry {
    info: ModuleInfo,
    last_seen: Instant,
}

struct DeviceEntry {
    name: String,
    parent: String,
    modules: HashMap<String, ModuleEntry>,
}

#[derive(Default)]
struct Table {
    devices: HashMap<String, DeviceEntry>,
}

impl Table {
    fn prune(&mut self) {
        let now = Instant::now();
        for device in self.devices.values_mut() {
            device
                .modules
                .retain(|_, m| now.duration_since(m.last_seen) < STALE_AFTER);
        }
        self.devices.retain(|_, d| !d.modules.is_empty());
    }

    fn upsert(&mut self, record: DiscoveryRecord) {
        // A module re-knocking from a new device moves; stale claims go.
        for (device_id, device) in self.devices.iter_mut() {
            if device_id != &record.device_id {
                for info in &record.modules {
                    device.modules.remove(&info.name);
                }
            }
        }
        let device = self
            .devices
            .entry(record.device_id.clone())
            .or_insert_with(|| DeviceEntry {
                name: record.name.clone(),
                parent: record.parent_device_id.clone(),
                modules: HashMap::new(),
            });
        device.name = record.name;
        device.parent = record.parent_device_id;
        for info in record.modules {
            device.modules.insert(
                info.name.clone(),
                ModuleEntry {
                    info,
                    last_seen: Instant::now(),
                },
            );
        }
    }

    fn touch(&mut self, device_id: &str, module: &str) -> bool {
        match self
            .devices
            .get_mut(device_id)
            .and_then(|d| d.modules.get_mut(module))
        {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    fn route_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (device_id, device) in &self.devices {
            for name in device.modules.keys() {
                map.insert(name.clone(), device_id.clone());
            }
        }
        map
    }

    fn listing(&self) -> Vec<ListedModule> {
        let mut out = Vec::new();
        for (device_id, device) in &self.devices {
            for entry in device.modules.values() {
                out.push(ListedModule {
                    device_id: device_id.clone(),
                    device_name: device.name.clone(),
                    name: entry.info.name.clone(),
                    desc: entry.info.desc.clone(),
                    version: entry.info.version.clone(),
                });
            }
        }
        out.sort_by(|a, b| (&a.device_id, &a.name).cmp(&(&b.device_id, &b.name)));
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedModule {
    pub device_id: String,
    pub device_name: String,
    pub name: String,
    pub desc: String,
    pub version: String,
}

/// Start the registry module on the given transport.
pub fn start(
    transport: Arc<dyn Transport>,
    device_code: &str,
    device_name: &str,
    store: Arc<dyn SettingStore>,
) -> Result<Module, StartError> {
    let table = Arc::new(Mutex::new(Table::default()));
    let own_device = device_code.to_string();
    // Filled once the module is up; the forward handler relays through it.
    let forwarder: Arc<Mutex<Option<Module>>> = Arc::default();
    let relay = Arc::clone(&forwarder);

    let handlers = Handlers::new().on_request(move |route, ctx| {
        let mut table = match table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.prune();
        match route {
            routes::KNOCK_DOOR => {
                let record: DiscoveryRecord = ctx.bind()?;
                if record.device_id.is_empty() {
                    return Err(RequestError::bad_req("empty device id"));
                }
                info!(
                    "registry: {} knocked from device {}",
                    record
                        .modules
                        .iter()
                        .map(|m| m.name.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                    record.device_id
                );
                table.upsert(record);
                Ok(json_payload(&table.route_map()))
            }
            routes::MODULE_LIST => Ok(json_payload(&table.listing())),
            routes::SERVER_DEV_ID => Ok(own_device.clone().into_bytes()),
            routes::HEART => {
                let raw = ctx.raw().to_vec();
                match modlink_core::routes::parse_heart(&raw) {
                    Some((device, module)) => {
                        if !table.touch(&device, &module) {
                            warn!("registry: heart from unknown {module} on {device}");
                        }
                        Ok(Vec::new())
                    }
                    None => Err(RequestError::bad_req("malformed heartbeat")),
                }
            }
            routes::FORWARD => {
                let wrapped: RequestEnvelope = ctx.bind()?;
                // Target grammar is `module/route`; the device comes from the
                // table unless the module part is already qualified.
                let module_part = match wrapped.to.split_once(address::FORWARD_SEP) {
                    Some((module, _)) => module,
                    None => wrapped.to.as_str(),
                };
                let (name, device) = address::resolve(module_part);
                let device = if device.is_empty() {
                    table.route_map().get(&name).cloned()
                } else {
                    Some(device)
                };
                drop(table);
                let Some(device) = device else {
                    return Err(RequestError::new(
                        ResponseCode::RouteNotFind,
                        format!("no module {name} registered"),
                    ));
                };
                let module = relay.lock().ok().and_then(|m| m.clone());
                let Some(module) = module else {
                    return Err(RequestError::error("registry not ready"));
                };
                let target = address::compose(&name, &device);
                debug!("registry: forwarding {} to {target}", wrapped.route);
                module.send_request(&target, &wrapped.route, &wrapped.payload)
            }
            _ => Err(RequestError::route_not_find()),
        }
    });

    let setting = Setting::new(ROUTE_MODULE, "module registry", env!("CARGO_PKG_VERSION"))
        .with_device(device_code, device_name);
    let module = Module::start(setting, handlers, transport, store)?;
    if let Ok(mut slot) = forwarder.lock() {
        *slot = Some(module.clone());
    }
    Ok(module)
}
