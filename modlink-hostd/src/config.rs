//! Load daemon config from file and environment, plus the on-disk setting
//! store modules persist through.
//!
//! File: ~/.config/modlink/config.toml or /etc/modlink/config.toml.
//! Env overrides: MODLINK_DEVICE_CODE, MODLINK_DEVICE_NAME, MODLINK_SETTING_DIR.

use std::path::{Path, PathBuf};

use modlink_core::setting::{Setting, SettingStore, StoreError};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device id this host registers under (default "local").
    #[serde(default = "default_device_code")]
    pub device_code: String,
    #[serde(default)]
    pub device_name: String,
    /// Directory module settings persist to.
    #[serde(default = "default_setting_dir")]
    pub setting_dir: PathBuf,
}

fn default_device_code() -> String {
    "local".to_string()
}

fn default_setting_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/modlink"),
        None => PathBuf::from("/var/lib/modlink"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_code: default_device_code(),
            device_name: String::new(),
            setting_dir: default_setting_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("MODLINK_DEVICE_CODE") {
        if !s.is_empty() {
            c.device_code = s;
        }
    }
    if let Ok(s) = std::env::var("MODLINK_DEVICE_NAME") {
        if !s.is_empty() {
            c.device_name = s;
        }
    }
    if let Ok(s) = std::env::var("MODLINK_SETTING_DIR") {
        if !s.is_empty() {
            c.setting_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        out.push(PathBuf::from(home).join(".config/modlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/modlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

/// Per-module TOML files under one directory.
pub struct FileSettingStore {
    dir: PathBuf,
}

impl FileSettingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, module: &str) -> PathBuf {
        // Module names are route identifiers, not paths.
        let safe: String = module
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.toml"))
    }
}

impl SettingStore for FileSettingStore {
    fn load(&self, module: &str) -> Result<Option<Setting>, StoreError> {
        let path = self.path_for(module);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| StoreError(format!("read {}: {e}", path.display())))?;
        let setting = toml::from_str(&text)
            .map_err(|e| StoreError(format!("parse {}: {e}", path.display())))?;
        Ok(Some(setting))
    }

    fn save(&self, setting: &Setting) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError(format!("mkdir {}: {e}", self.dir.display())))?;
        let text = toml::to_string_pretty(setting)
            .map_err(|e| StoreError(format!("encode setting: {e}")))?;
        let path = self.path_for(&setting.module);
        write_atomic(&path, text.as_bytes())
            .map_err(|e| StoreError(format!("write {}: {e}", path.display())))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "modlink-store-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn store_roundtrip() {
        let dir = temp_dir("roundtrip");
        let store = FileSettingStore::new(&dir);
        assert!(store.load("Backup").unwrap().is_none());

        let setting = Setting::new("Backup", "backup module", "1.0.0").with_device("dev01", "rack");
        store.save(&setting).unwrap();
        let loaded = store.load("Backup").unwrap().unwrap();
        assert_eq!(loaded.module, "Backup");
        assert_eq!(loaded.device_code, "dev01");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn module_name_is_sanitized_for_the_filesystem() {
        let store = FileSettingStore::new("/tmp/x");
        let path = store.path_for("../evil/name");
        assert_eq!(path, PathBuf::from("/tmp/x/___evil_name.toml"));
    }

    #[test]
    fn defaults_apply() {
        let c = Config::default();
        assert_eq!(c.device_code, "local");
        assert!(c.setting_dir.to_string_lossy().contains("modlink"));
    }
}
