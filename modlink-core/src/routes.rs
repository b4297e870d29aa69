//! Route table and discovery operations against the `Route` registry module.
//!
//! The knock-door reply carries the authoritative module-to-device map for the
//! hierarchy; each refresh replaces the whole table atomically. Between
//! refreshes the table may be stale, so resolution falls back to the local
//! device for unknown names.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::address;
use crate::adapter::Adapter;
use crate::context::{json_payload, Context};
use crate::error::RequestError;
use crate::protocol::{routes, DiscoveryRecord, ModuleInfo, ROUTE_MODULE};
use crate::setting::Setting;

/// Separator inside a heartbeat payload (`device^module`).
pub const HEART_SEP: char = '^';

/// Module-name to device-id map learned from the registry.
#[derive(Default)]
pub struct RouteTable {
    map: RwLock<HashMap<String, String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device id registered for `name`, if the registry announced one.
    pub fn device_of(&self, name: &str) -> Option<String> {
        match self.map.read() {
            Ok(map) => map.get(name).cloned(),
            Err(_) => None,
        }
    }

    /// Qualified identity for a send target. Unknown names fall back to the
    /// local device; pre-qualified targets pass through untouched.
    pub fn target_for(&self, name: &str, local_device: &str) -> String {
        if name.contains(address::MODULE_DEVICE_SEP) {
            return name.to_string();
        }
        let device = self
            .device_of(name)
            .unwrap_or_else(|| local_device.to_string());
        address::compose(name, &device)
    }

    /// Replace the whole table with a fresh registry snapshot.
    pub fn replace(&self, fresh: HashMap<String, String>) {
        if let Ok(mut map) = self.map.write() {
            *map = fresh;
        }
    }

    pub fn clear(&self) {
        self.replace(HashMap::new());
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether this module participates in discovery at all. The registry module
/// itself and temporary devices never knock.
pub fn should_knock(setting: &Setting) -> bool {
    setting.module != ROUTE_MODULE
        && !setting.device_code.is_empty()
        && !address::is_temporary(&setting.device_code)
}

/// Identity of the registry instance a module talks to: the local `Route`
/// instance on its own device, or the bare root registry when the module
/// sits on the root device itself.
pub fn registry_target(device_code: &str, parent_device: &str) -> String {
    if device_code.is_empty() || device_code == parent_device {
        ROUTE_MODULE.to_string()
    } else {
        address::compose(ROUTE_MODULE, device_code)
    }
}

/// Announce this module to the registry and return the fresh route table.
pub fn knock_door(
    adapter: &dyn Adapter,
    setting: &Setting,
    parent_device: &str,
    timeout: Duration,
) -> Result<HashMap<String, String>, RequestError> {
    let record = DiscoveryRecord {
        device_id: setting.device_code.clone(),
        name: setting.device_name.clone(),
        parent_device_id: parent_device.to_string(),
        modules: vec![ModuleInfo {
            name: setting.module.clone(),
            desc: setting.desc.clone(),
            version: setting.version.clone(),
        }],
    };
    let target = registry_target(&setting.device_code, parent_device);
    let resp = adapter.request(&target, routes::KNOCK_DOOR, &json_payload(&record), timeout);
    if !resp.code.is_success() {
        return Err(RequestError::from_response(&resp));
    }
    let ctx = Context::from_payload(&resp.payload)?;
    ctx.bind()
}

/// Ask the registry which device id this module's device hangs under.
/// An empty answer means the device is the hierarchy root.
pub fn query_parent_device(
    adapter: &dyn Adapter,
    setting: &Setting,
    timeout: Duration,
) -> Result<String, RequestError> {
    let target = registry_target(&setting.device_code, "");
    let resp = adapter.request(&target, routes::SERVER_DEV_ID, &[], timeout);
    if !resp.code.is_success() {
        return Err(RequestError::from_response(&resp));
    }
    Ok(String::from_utf8_lossy(&resp.payload).trim().to_string())
}

/// Heartbeat payload: the JSON string `"device^module"`.
pub fn heart_payload(device_code: &str, module: &str) -> Vec<u8> {
    json_payload(&format!("{device_code}{HEART_SEP}{module}"))
}

/// Split a heartbeat payload back into `(device, module)`.
pub fn parse_heart(payload: &[u8]) -> Option<(String, String)> {
    let text: String = serde_json::from_slice(payload).ok()?;
    let (device, module) = text.split_once(HEART_SEP)?;
    Some((device.to_string(), module.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_resolution_falls_back_to_local_device() {
        let table = RouteTable::new();
        table.replace(HashMap::from([("Backup".to_string(), "dev02".to_string())]));
        assert_eq!(table.target_for("Backup", "dev01"), "Backup.dev02");
        assert_eq!(table.target_for("Unknown", "dev01"), "Unknown.dev01");
        assert_eq!(table.target_for("Pinned.dev09", "dev01"), "Pinned.dev09");
    }

    #[test]
    fn replace_is_total() {
        let table = RouteTable::new();
        table.replace(HashMap::from([("Old".to_string(), "dev01".to_string())]));
        table.replace(HashMap::from([("New".to_string(), "dev02".to_string())]));
        assert_eq!(table.device_of("Old"), None);
        assert_eq!(table.device_of("New").as_deref(), Some("dev02"));
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn knock_skipped_for_registry_temp_and_bare() {
        let mut s = Setting::new("Backup", "", "1.0").with_device("dev01", "");
        assert!(should_knock(&s));
        s.device_code = "dev01[TEMP]".to_string();
        assert!(!should_knock(&s));
        s.device_code = String::new();
        assert!(!should_knock(&s));
        let r = Setting::new("Route", "", "1.0").with_device("dev01", "");
        assert!(!should_knock(&r));
    }

    #[test]
    fn registry_target_prefers_local_instance() {
        assert_eq!(registry_target("dev01", "root"), "Route.dev01");
        assert_eq!(registry_target("root", "root"), "Route");
        assert_eq!(registry_target("", ""), "Route");
    }

    #[test]
    fn heart_payload_roundtrip() {
        let payload = heart_payload("plant_line3", "Backup");
        assert_eq!(payload, br#""plant_line3^Backup""#);
        assert_eq!(
            parse_heart(&payload),
            Some(("plant_line3".to_string(), "Backup".to_string()))
        );
        assert_eq!(parse_heart(br#""no-separator""#), None);
        assert_eq!(parse_heart(b"not json"), None);
    }
}
