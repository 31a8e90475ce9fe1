// SPDX-License-Identifier: GPL-2.0

//! Daemon configuration.
//!
//! Loaded from a TOML file under the user config directory, with a plain-text
//! `ignore.txt` (one executable name per line, `#` comments) merged into the
//! ignore list. A missing config file is not an error; defaults apply.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

const CONFIG_DIR: &str = "ccd-gamed";
const CONFIG_FILE: &str = "config.toml";
const IGNORE_FILE: &str = "ignore.txt";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Poll interval for scan/apply ticks.
    #[serde(deserialize_with = "de_duration")]
    pub interval: Duration,
    /// Environment keys carrying game identity, in priority order.
    pub env_keys: Vec<String>,
    /// Executable base names treated as games when no environment evidence
    /// matches. Lower-cased on load.
    pub exe_allowlist: Vec<String>,
    /// Executable base names never treated as games.
    pub ignore_exe: Vec<String>,
    /// Also pin the user session slice to the OS CPU set.
    pub pin_session_slice: bool,
    /// Additional slices pinned to the OS CPU set.
    pub pin_slices: Vec<String>,
    /// Manual override for the OS CPU set; bypasses topology detection when
    /// both overrides are non-empty.
    pub os_cpus: String,
    /// Manual override for the game CPU set.
    pub game_cpus: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            env_keys: vec![
                "SteamAppId".to_string(),
                "SteamGameId".to_string(),
                "STEAM_COMPAT_APP_ID".to_string(),
            ],
            exe_allowlist: Vec::new(),
            ignore_exe: Vec::new(),
            pin_session_slice: false,
            pin_slices: Vec::new(),
            os_cpus: String::new(),
            game_cpus: String::new(),
        }
    }
}

impl Config {
    /// Load the config from the given path (default path when `None`),
    /// merging the sibling ignore file. A missing config file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => config_dir()?.join(CONFIG_FILE),
        };
        let ignore_path = config_dir()?.join(IGNORE_FILE);
        Self::load_from(&config_path, &ignore_path)
    }

    /// Load with fully injected paths; everything above `load` is path
    /// resolution only.
    pub fn load_from(config_path: &Path, ignore_path: &Path) -> Result<Config> {
        let mut config = match std::fs::read_to_string(config_path) {
            Ok(content) => parse_config_content(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", config_path.display()))
            }
        };

        if let Ok(content) = std::fs::read_to_string(ignore_path) {
            config.ignore_exe.extend(parse_ignore_content(&content));
        }

        config.exe_allowlist = normalize_names(&config.exe_allowlist);
        config.ignore_exe = normalize_names(&config.ignore_exe);
        Ok(config)
    }
}

fn parse_config_content(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    if config.interval.is_zero() {
        anyhow::bail!("interval must be positive");
    }
    Ok(config)
}

/// One executable name per line; blank lines and `#` comments are skipped.
fn parse_ignore_content(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Lower-case, trim, and deduplicate while preserving order.
fn normalize_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_lowercase();
        if name.is_empty() || out.contains(&name) {
            continue;
        }
        out.push(name);
    }
    out
}

fn config_dir() -> Result<PathBuf> {
    let base = match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            Path::new(&home).join(".config")
        }
    };
    Ok(base.join(CONFIG_DIR))
}

/// Parse durations like "500ms", "5s", or "2m"; a bare integer is seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => anyhow::bail!("invalid duration unit {unit:?} in {s:?}"),
    }
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(
            &tmp.path().join("does-not-exist.toml"),
            &tmp.path().join("ignore.txt"),
        )
        .unwrap();
        assert!(cfg.interval > Duration::ZERO);
        assert!(!cfg.env_keys.is_empty());
    }

    #[test]
    fn test_parses_toml_and_ignore_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        let ignore_path = tmp.path().join("ignore.txt");
        std::fs::write(
            &config_path,
            r#"interval = "5s"
env_keys = ["SteamAppId", "STEAM_COMPAT_APP_ID"]
exe_allowlist = ["Foo", "bar"]
pin_session_slice = true
pin_slices = ["app.slice"]
os_cpus = "0-7"
game_cpus = "8-15"
"#,
        )
        .unwrap();
        std::fs::write(&ignore_path, "# comment\nsteam\ncustom-helper\n").unwrap();

        let cfg = Config::load_from(&config_path, &ignore_path).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(5));
        assert!(cfg.pin_session_slice);
        assert_eq!(cfg.pin_slices, vec!["app.slice"]);
        assert_eq!(cfg.os_cpus, "0-7");
        assert_eq!(cfg.game_cpus, "8-15");
        assert!(cfg.ignore_exe.contains(&"custom-helper".to_string()));
        assert!(cfg.ignore_exe.contains(&"steam".to_string()));
        assert!(cfg.exe_allowlist.contains(&"foo".to_string()));
        assert!(cfg.exe_allowlist.contains(&"bar".to_string()));
    }

    #[test]
    fn test_ignore_file_without_config() {
        let tmp = tempfile::tempdir().unwrap();
        let ignore_path = tmp.path().join("ignore.txt");
        std::fs::write(&ignore_path, "custom-helper\n").unwrap();

        let cfg = Config::load_from(&tmp.path().join("missing.toml"), &ignore_path).unwrap();
        assert!(cfg.ignore_exe.contains(&"custom-helper".to_string()));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("5h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(parse_config_content("interval = \"0s\"").is_err());
    }

    #[test]
    fn test_normalize_names_deduplicates() {
        let names = vec![" Foo ".to_string(), "foo".to_string(), "".to_string()];
        assert_eq!(normalize_names(&names), vec!["foo"]);
    }
}
