//! Collection of slave addresses seen with a valid CRC, per gateway.
//!
//! The report written at shutdown is the survey result: it tells the
//! operator which addresses actually answer on each tapped bus.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, TapSrvError};

#[derive(Debug, Default)]
pub struct SlaveCollector {
    ids: Mutex<BTreeMap<String, BTreeSet<u8>>>,
}

impl SlaveCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, gateway: &str, slave: u8) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.entry(gateway.to_string()).or_default().insert(slave);
    }

    /// Sorted snapshot of everything recorded so far.
    pub fn report(&self) -> BTreeMap<String, Vec<u8>> {
        let ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.iter()
            .map(|(gw, set)| (gw.clone(), set.iter().copied().collect()))
            .collect()
    }

    /// One line per gateway, `name: 1, 2, 3` or `name: none`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (gateway, slaves) in self.report() {
            let _ = write!(out, "{gateway}: ");
            if slaves.is_empty() {
                out.push_str("none");
            } else {
                for (i, slave) in slaves.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{slave}");
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn write_report(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.render()).map_err(|e| {
            TapSrvError::io(format!("cannot write {}: {e}", path.display()))
        })
    }
}

/// Suffix distinguishing report files when several configs run side by
/// side, `"_<config-stem>"` or empty for the default `config` name.
pub fn report_suffix(config_path: &Path) -> String {
    let stem = config_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if stem.is_empty() || stem == "config" {
        String::new()
    } else {
        format!("_{stem}")
    }
}
