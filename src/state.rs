// SPDX-License-Identifier: GPL-2.0

//! Persistent pin state.
//!
//! Records which units were pinned and, per unit, the `AllowedCPUs` value it
//! had before the daemon first touched it. Losing that record would make a
//! pin unrecoverable, so writes are atomic: serialize to a sibling temporary
//! file, then rename over the target.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const STATE_DIR: &str = "ccd-gamed";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateFile {
    pub version: u32,
    pub pin_applied: bool,
    /// Unit name to the `AllowedCPUs` value it had before the first pin.
    /// Captured once per unit and kept until restored.
    pub original_allowed_cpus: BTreeMap<String, String>,
    pub os_cpus: String,
    pub game_cpus: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_successful_restore: Option<DateTime<Utc>>,
    pub last_successful_pin_apply: Option<DateTime<Utc>>,
}

/// Resolve the per-user state file path: `$XDG_STATE_HOME` wins over the
/// computed `~/.local/state` default.
pub fn default_path() -> Result<PathBuf> {
    let base = match std::env::var("XDG_STATE_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            Path::new(&home).join(".local").join("state")
        }
    };
    Ok(base.join(STATE_DIR).join(STATE_FILE))
}

/// Load the state file. A missing file yields a fresh default record; a
/// present-but-unparsable file is an error.
pub fn load(path: &Path) -> Result<StateFile> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StateFile {
                version: 1,
                ..Default::default()
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let mut st: StateFile = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if st.version == 0 {
        st.version = 1;
    }
    Ok(st)
}

/// Stamp and persist the state via atomic replace.
pub fn save(path: &Path, st: &mut StateFile) -> Result<()> {
    st.updated_at = Some(Utc::now());
    if st.version == 0 {
        st.version = 1;
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(st).context("failed to serialize state")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} over {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let st = load(&tmp.path().join("does-not-exist.json")).unwrap();
        assert_eq!(st.version, 1);
        assert!(!st.pin_applied);
        assert!(st.original_allowed_cpus.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("state.json");

        let mut st = StateFile {
            version: 1,
            pin_applied: true,
            os_cpus: "0-7".to_string(),
            game_cpus: "8-15".to_string(),
            ..Default::default()
        };
        st.original_allowed_cpus
            .insert("app.slice".to_string(), String::new());
        st.original_allowed_cpus
            .insert("game-1.scope".to_string(), "0-15".to_string());
        save(&path, &mut st).unwrap();
        assert!(st.updated_at.is_some());

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, st);
        // The temporary sibling must not survive a successful save.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_upgrades_version_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, br#"{"version": 0, "pin_applied": true}"#).unwrap();

        let st = load(&path).unwrap();
        assert_eq!(st.version, 1);
        assert!(st.pin_applied);
        // Upgrade happens in memory only.
        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["version"], 0);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"not json").unwrap();
        assert!(load(&path).is_err());
    }
}
