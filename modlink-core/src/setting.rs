//! Module configuration and user handler registration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::RequestError;
use crate::protocol::LinkState;

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSetting {
    pub addr: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    pub retry: u32,
    /// How long `start` waits for the link before proceeding anyway.
    /// 0 = wait indefinitely.
    pub link_wait_ms: u64,
    pub random_client_id: bool,
}

impl Default for BrokerSetting {
    fn default() -> Self {
        Self {
            addr: "ws://127.0.0.1:5002/ws".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_ms: 3000,
            retry: 3,
            link_wait_ms: 3000,
            random_client_id: false,
        }
    }
}

/// Immutable-after-start module configuration. The only sanctioned mutation
/// is device-code reassignment through `Module::reset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub module: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub device_code: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub broker: BrokerSetting,
    /// Serialize inbound request dispatch into arrival order.
    #[serde(default)]
    pub sync_dispatch: bool,
}

impl Setting {
    pub fn new(module: &str, desc: &str, version: &str) -> Self {
        Self {
            module: module.to_string(),
            desc: desc.to_string(),
            version: version.to_string(),
            device_code: String::new(),
            device_name: String::new(),
            broker: BrokerSetting::default(),
            sync_dispatch: false,
        }
    }

    pub fn with_device(mut self, code: &str, name: &str) -> Self {
        self.device_code = code.to_string();
        self.device_name = name.to_string();
        self
    }

    /// Qualified identity this module is addressed by.
    pub fn client_id(&self) -> String {
        crate::address::compose(&self.module, &self.device_code)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.timeout_ms)
    }

    /// `None` means wait for the link indefinitely.
    pub fn link_wait(&self) -> Option<Duration> {
        match self.broker.link_wait_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Configuration collaborator: load a persisted setting, save the effective
/// one. The core calls `save` once at the end of a successful start and logs
/// (never propagates) store failures.
pub trait SettingStore: Send + Sync {
    fn load(&self, module: &str) -> Result<Option<Setting>, StoreError>;
    fn save(&self, setting: &Setting) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
#[error("setting store: {0}")]
pub struct StoreError(pub String);

/// Store that persists nothing. Used by plugin hosts and tests.
pub struct NullStore;

impl SettingStore for NullStore {
    fn load(&self, _module: &str) -> Result<Option<Setting>, StoreError> {
        Ok(None)
    }

    fn save(&self, _setting: &Setting) -> Result<(), StoreError> {
        Ok(())
    }
}

pub type RequestHandler =
    Arc<dyn Fn(&str, &Context) -> Result<Vec<u8>, RequestError> + Send + Sync>;
pub type NoticeHandler = Arc<dyn Fn(&str, &Context) + Send + Sync>;

/// User callback registration. One handler per concern; route fan-out happens
/// inside the request handler (closed signature, no reflection).
#[derive(Default, Clone)]
pub struct Handlers {
    pub(crate) on_init: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_request: Option<RequestHandler>,
    pub(crate) on_notice: Option<NoticeHandler>,
    pub(crate) on_retain_notice: Option<NoticeHandler>,
    pub(crate) on_state: Option<Arc<dyn Fn(LinkState) + Send + Sync>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_init = Some(Arc::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(f));
        self
    }

    pub fn on_request(
        mut self,
        f: impl Fn(&str, &Context) -> Result<Vec<u8>, RequestError> + Send + Sync + 'static,
    ) -> Self {
        self.on_request = Some(Arc::new(f));
        self
    }

    pub fn on_notice(mut self, f: impl Fn(&str, &Context) + Send + Sync + 'static) -> Self {
        self.on_notice = Some(Arc::new(f));
        self
    }

    pub fn on_retain_notice(mut self, f: impl Fn(&str, &Context) + Send + Sync + 'static) -> Self {
        self.on_retain_notice = Some(Arc::new(f));
        self
    }

    pub fn on_state(mut self, f: impl Fn(LinkState) + Send + Sync + 'static) -> Self {
        self.on_state = Some(Arc::new(f));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_wait_zero_means_indefinite() {
        let mut s = Setting::new("Backup", "backup module", "1.0.0");
        s.broker.link_wait_ms = 0;
        assert_eq!(s.link_wait(), None);
        s.broker.link_wait_ms = 200;
        assert_eq!(s.link_wait(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn client_id_composes_identity() {
        let s = Setting::new("Backup", "", "1.0.0").with_device("dev01", "rack 1");
        assert_eq!(s.client_id(), "Backup.dev01");
        let s = Setting::new("Backup", "", "1.0.0");
        assert_eq!(s.client_id(), "Backup");
    }

    #[test]
    fn setting_serde_roundtrip() {
        let s = Setting::new("Backup", "backup module", "1.0.0").with_device("dev01", "rack 1");
        let json = serde_json::to_string(&s).unwrap();
        let back: Setting = serde_json::from_str(&json).unwrap();
        assert_eq!(back.module, "Backup");
        assert_eq!(back.device_code, "dev01");
        assert_eq!(back.broker.timeout_ms, 3000);
    }
}
