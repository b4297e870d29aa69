//! Hierarchical addressing: compose and resolve module identities.
//!
//! Grammar (fixed here as policy): `.` separates a module name from the device
//! code hosting it (`Backup.dev01`), `_` chains a child device id onto its
//! parent (`plant_line3`), `/` marks a router-forwarded target
//! (`Backup/Run` = "ask the Route module to forward"), and a device code
//! ending in `[TEMP]` marks a temporary device that never joins the hierarchy.

/// Separator between module name and device code.
pub const MODULE_DEVICE_SEP: char = '.';
/// Separator chaining a child device id onto its parent device id.
pub const DEVICE_CHAIN_SEP: char = '_';
/// Separator marking a router-forwarded `module/route` target.
pub const FORWARD_SEP: char = '/';
/// Suffix marking a temporary device code; such devices skip knock-door.
pub const TEMP_DEVICE_SUFFIX: &str = "[TEMP]";

/// Compose a qualified module identity `"<name>.<device_code>"`.
///
/// A name that already contains `.` is treated as pre-qualified and returned
/// unchanged (never double-appended). An empty device code collapses to the
/// bare name. Byte-exact, no case normalization, never fails: malformed input
/// degrades to best-effort concatenation with stray separators trimmed.
pub fn compose(name: &str, device_code: &str) -> String {
    let qualified = if name.contains(MODULE_DEVICE_SEP) || device_code.is_empty() {
        name.to_string()
    } else {
        format!("{name}{MODULE_DEVICE_SEP}{device_code}")
    };
    qualified.trim_matches(MODULE_DEVICE_SEP).to_string()
}

/// Split a qualified identity into `(name, device_code)`.
///
/// Splits on the first `.`; an unqualified name yields an empty device code.
pub fn resolve(qualified: &str) -> (String, String) {
    let qualified = qualified.trim_matches(MODULE_DEVICE_SEP);
    match qualified.split_once(MODULE_DEVICE_SEP) {
        Some((name, device)) => (name.to_string(), device.to_string()),
        None => (qualified.to_string(), String::new()),
    }
}

/// Whether a send target is a router-forwarded `module/route` pair.
pub fn is_forwarded(target: &str) -> bool {
    target.contains(FORWARD_SEP)
}

/// Whether a device code marks a temporary device (not a hierarchy participant).
pub fn is_temporary(device_code: &str) -> bool {
    device_code.ends_with(TEMP_DEVICE_SUFFIX)
}

/// Chain a child device id onto its parent: `"parent_child"`.
///
/// An empty parent yields the bare child id (root devices have no parent).
pub fn child_device_id(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}{DEVICE_CHAIN_SEP}{child}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_resolve_roundtrip() {
        let cases = [("Backup", "dev01"), ("a", "b"), ("Route", "plant_line3")];
        for (name, dev) in cases {
            assert_eq!(resolve(&compose(name, dev)), (name.into(), dev.into()));
        }
    }

    #[test]
    fn compose_empty_device_is_bare_name() {
        assert_eq!(compose("Backup", ""), "Backup");
        assert_eq!(resolve("Backup"), ("Backup".into(), String::new()));
    }

    #[test]
    fn compose_prequalified_is_noop() {
        assert_eq!(compose("Backup.dev01", "dev02"), "Backup.dev01");
        assert_eq!(compose(&compose("Backup", "dev01"), "dev02"), "Backup.dev01");
    }

    #[test]
    fn compose_trims_stray_separators() {
        assert_eq!(compose(".Backup.", ""), "Backup");
        assert_eq!(compose("Backup.", "dev01"), "Backup");
    }

    #[test]
    fn resolve_splits_on_first_separator() {
        // Device codes may themselves contain `.` from odd operator input;
        // only the first separator is structural.
        assert_eq!(resolve("A.b.c"), ("A".into(), "b.c".into()));
    }

    #[test]
    fn addressing_is_byte_exact() {
        assert_eq!(compose("BACKUP", "Dev01"), "BACKUP.Dev01");
        assert_ne!(compose("backup", "dev01"), compose("Backup", "dev01"));
    }

    #[test]
    fn forwarded_and_temporary_detection() {
        assert!(is_forwarded("Backup/Run"));
        assert!(!is_forwarded("Backup"));
        assert!(is_temporary("dev01[TEMP]"));
        assert!(!is_temporary("dev01"));
    }

    #[test]
    fn device_chaining() {
        assert_eq!(child_device_id("plant", "line3"), "plant_line3");
        assert_eq!(child_device_id("", "plant"), "plant");
        assert_eq!(
            child_device_id(&child_device_id("plant", "line3"), "cell7"),
            "plant_line3_cell7"
        );
    }
}
