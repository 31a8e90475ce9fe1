// SPDX-License-Identifier: GPL-2.0

//! Unit naming and the `systemctl` command adapter.
//!
//! Affinity reads/writes and unit starts go through the `systemctl` binary in
//! user scope. The D-Bus path (see `dbus`) is preferred for transient scope
//! creation; this adapter covers the property plumbing systemd only exposes
//! conveniently via `set-property`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::process::Command;

/// Upper bound on any single systemctl invocation so a hung service manager
/// cannot stall the daemon.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Turn an arbitrary game identifier into a stable, safe systemd scope unit
/// name: `game-<id>.scope`. Total and deterministic, so the same game maps to
/// the same unit across restarts.
pub fn unit_name_for_game_id(game_id: &str) -> String {
    let game_id = game_id.trim();
    let sanitized: String = game_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut sanitized: &str = sanitized.trim_matches(|c| c == '-' || c == '_');
    if sanitized.is_empty() {
        sanitized = "unknown";
    }
    let truncated: String = sanitized.chars().take(80).collect();
    format!("game-{truncated}.scope")
}

/// Thin wrapper around `systemctl --user`. In dry-run mode mutating commands
/// only log the intended invocation and report success.
#[derive(Debug, Clone)]
pub struct Systemctl {
    pub dry_run: bool,
    command: PathBuf,
}

impl Systemctl {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            command: PathBuf::from("systemctl"),
        }
    }

    /// Point the adapter at an alternate systemctl binary. Used by tests.
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    /// Read the current `AllowedCPUs` value of a unit, trimmed.
    pub async fn get_allowed_cpus(&self, unit: &str) -> Result<String> {
        self.run(&["--user", "show", "-p", "AllowedCPUs", "--value", unit])
            .await
            .with_context(|| format!("systemctl show {unit}"))
    }

    pub async fn set_allowed_cpus(&self, unit: &str, cpus: &str) -> Result<()> {
        let property = format!("AllowedCPUs={cpus}");
        let args = ["--user", "set-property", "--runtime", unit, property.as_str()];
        if self.dry_run {
            info!("dry-run: systemctl {}", args.join(" "));
            return Ok(());
        }
        self.run(&args)
            .await
            .with_context(|| format!("systemctl set-property {unit}"))?;
        Ok(())
    }

    pub async fn start_unit(&self, unit: &str) -> Result<()> {
        let args = ["--user", "start", unit];
        if self.dry_run {
            info!("dry-run: systemctl {}", args.join(" "));
            return Ok(());
        }
        self.run(&args)
            .await
            .with_context(|| format!("systemctl start {unit}"))?;
        Ok(())
    }

    /// Run systemctl and return trimmed combined output, folding
    /// stdout+stderr into the error message on non-zero exit for
    /// diagnosability.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(&self.command)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .with_context(|| format!("systemctl {} timed out", args.join(" ")))?
        .context("failed to run systemctl")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if !output.status.success() {
            bail!(
                "systemctl {} failed: {} ({combined})",
                args.join(" "),
                output.status
            );
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_for_game_id() {
        assert_eq!(unit_name_for_game_id("12345"), "game-12345.scope");
        assert_eq!(unit_name_for_game_id("  "), "game-unknown.scope");
        assert_eq!(
            unit_name_for_game_id("weird id: (x)"),
            "game-weird_id___x.scope"
        );
    }

    #[test]
    fn test_unit_name_strips_edge_punctuation() {
        assert_eq!(unit_name_for_game_id("--name--"), "game-name.scope");
        assert_eq!(unit_name_for_game_id("__"), "game-unknown.scope");
        assert_eq!(unit_name_for_game_id("(((("), "game-unknown.scope");
    }

    #[test]
    fn test_unit_name_truncates_and_stays_safe() {
        let long = "x".repeat(200);
        let name = unit_name_for_game_id(&long);
        assert_eq!(name.len(), "game-.scope".len() + 80);

        for id in ["12345", "  ", "weird id: (x)", &long, "äöü", "a b\tc"] {
            let name = unit_name_for_game_id(id);
            let inner = name
                .strip_prefix("game-")
                .and_then(|s| s.strip_suffix(".scope"))
                .unwrap();
            assert!(!inner.is_empty() && inner.len() <= 80);
            assert!(inner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[tokio::test]
    async fn test_dry_run_mutations_succeed() {
        let ctl = Systemctl::new(true);
        ctl.set_allowed_cpus("game-1.scope", "8-15").await.unwrap();
        ctl.start_unit("game-1.scope").await.unwrap();
    }

    #[tokio::test]
    async fn test_affinity_read_failure_is_surfaced() {
        // Reads are not gated on dry-run; a failing invocation must come
        // back as an error, never as an empty value.
        let ctl = Systemctl::new(true).with_command("/nonexistent/systemctl");
        let err = ctl.get_allowed_cpus("game-1.scope").await.unwrap_err();
        assert!(format!("{err:#}").contains("systemctl show game-1.scope"));
    }
}
