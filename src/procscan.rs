// SPDX-License-Identifier: GPL-2.0

//! Process-table scanning.
//!
//! Walks the proc filesystem looking for processes owned by the configured
//! user that carry game evidence: either one of the configured environment
//! keys (earlier keys win) or an allowlisted executable name. Processes come
//! and go while the scan runs, so every per-process read failure means "the
//! process is gone" and skips that entry rather than failing the scan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Evidence source recorded when the executable allowlist, rather than an
/// environment key, identified the game.
pub const ID_SOURCE_EXE_ALLOWLIST: &str = "exe_allowlist";

/// One observed process believed to belong to a game. Recreated fresh on
/// every scan and never mutated afterwards.
///
/// `start_time` comes from the kernel's per-process stat record and lets
/// callers distinguish this PID from a future reuse of the same PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameProcess {
    pub pid: i32,
    pub start_time: u64,
    pub exe: String,
    pub game_id: String,
    pub id_source: String,
}

pub struct Scanner {
    uid: u32,
    env_key_order: Vec<String>,
    env_key_index: HashMap<String, usize>,
    exe_allowlist: HashSet<String>,
    ignore_exe: HashSet<String>,
    proc_root: PathBuf,
}

impl Scanner {
    pub fn new(uid: u32, env_keys: &[String], exe_allowlist: &[String], ignore_exe: &[String]) -> Self {
        let mut env_key_order = Vec::with_capacity(env_keys.len());
        let mut env_key_index = HashMap::with_capacity(env_keys.len());
        for key in env_keys {
            let key = key.trim();
            if key.is_empty() || env_key_index.contains_key(key) {
                continue;
            }
            env_key_index.insert(key.to_string(), env_key_order.len());
            env_key_order.push(key.to_string());
        }

        Self {
            uid,
            env_key_order,
            env_key_index,
            exe_allowlist: to_set_lower(exe_allowlist),
            ignore_exe: to_set_lower(ignore_exe),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Point the scanner at an alternate proc root. Used by tests.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Scan the process table and group qualifying processes by game id,
    /// preserving discovery order within each group.
    pub fn scan(&self) -> Result<BTreeMap<String, Vec<GameProcess>>> {
        let entries = fs::read_dir(&self.proc_root)
            .with_context(|| format!("failed to read {}", self.proc_root.display()))?;

        let mut results: BTreeMap<String, Vec<GameProcess>> = BTreeMap::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if pid <= 0 {
                continue;
            }
            let proc_dir = self.proc_root.join(name);
            if !self.is_owned_by_uid(&proc_dir) {
                continue;
            }

            let Some(exe) = exe_basename_lower(&proc_dir) else {
                continue;
            };
            if self.ignore_exe.contains(&exe) {
                continue;
            }

            let mut evidence = self.game_id_from_environ(&proc_dir);
            if evidence.is_none() && self.exe_allowlist.contains(&exe) {
                evidence = Some((exe.clone(), ID_SOURCE_EXE_ALLOWLIST.to_string()));
            }
            let Some((game_id, id_source)) = evidence else {
                continue;
            };

            // Identity hints matter more than a perfect timestamp.
            let start_time = proc_start_time(&proc_dir).unwrap_or(0);

            results.entry(game_id.clone()).or_default().push(GameProcess {
                pid,
                start_time,
                exe,
                game_id,
                id_source,
            });
        }
        Ok(results)
    }

    fn is_owned_by_uid(&self, proc_dir: &Path) -> bool {
        let Ok(content) = fs::read_to_string(proc_dir.join("status")) else {
            return false;
        };
        for line in content.lines() {
            let Some(rest) = line.strip_prefix("Uid:") else {
                continue;
            };
            return rest
                .split_whitespace()
                .next()
                .and_then(|field| field.parse::<u32>().ok())
                .is_some_and(|uid| uid == self.uid);
        }
        false
    }

    fn game_id_from_environ(&self, proc_dir: &Path) -> Option<(String, String)> {
        if self.env_key_order.is_empty() {
            return None;
        }
        let data = fs::read(proc_dir.join("environ")).ok()?;
        self.match_environ(&data)
    }

    /// Scan a NUL-separated environment block for the highest-priority
    /// configured key with a non-empty value. Returns (value, key).
    fn match_environ(&self, data: &[u8]) -> Option<(String, String)> {
        let mut best: Option<(usize, String, String)> = None;
        for entry in data.split(|&b| b == 0) {
            if entry.is_empty() {
                continue;
            }
            let Some(eq) = entry.iter().position(|&b| b == b'=') else {
                continue;
            };
            if eq == 0 {
                continue;
            }
            let Ok(key) = std::str::from_utf8(&entry[..eq]) else {
                continue;
            };
            let Some(&idx) = self.env_key_index.get(key) else {
                continue;
            };
            if best.as_ref().is_some_and(|(best_idx, _, _)| idx >= *best_idx) {
                continue;
            }
            let value = String::from_utf8_lossy(&entry[eq + 1..]).trim().to_string();
            if value.is_empty() {
                continue;
            }
            best = Some((idx, key.to_string(), value));
            if idx == 0 {
                break;
            }
        }
        best.map(|(_, key, value)| (value, key))
    }
}

/// Trim, lower-case, and deduplicate a name list, dropping empties.
pub fn to_set_lower(names: &[String]) -> HashSet<String> {
    names
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn exe_basename_lower(proc_dir: &Path) -> Option<String> {
    let target = fs::read_link(proc_dir.join("exe")).ok()?;
    let base = target.file_name()?.to_str()?.trim();
    if base.is_empty() {
        return None;
    }
    Some(base.to_lowercase())
}

/// Read the kernel start time (field 22 of the stat record). The comm field
/// may itself contain spaces and parentheses, so fields are only counted
/// after the last `)`.
fn proc_start_time(proc_dir: &Path) -> Option<u64> {
    let content = fs::read_to_string(proc_dir.join("stat")).ok()?;
    parse_start_time(content.trim())
}

fn parse_start_time(line: &str) -> Option<u64> {
    let rest = &line[line.rfind(')')? + 1..];
    // rest starts at field 3 (state); starttime is field 22.
    rest.split_whitespace().nth(19)?.parse().ok()
}
