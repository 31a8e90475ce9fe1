// SPDX-License-Identifier: GPL-2.0

//! Scan/apply/restore orchestration.
//!
//! A tick resolves the OS/game CPU sets, scans the process table, ensures a
//! transient scope per detected game, and pins scopes to the game set and the
//! configured slices to the OS set. For every unit, the pre-pin `AllowedCPUs`
//! value is persisted before the first mutation so a later restore can put
//! the system back exactly.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, info, warn};

use crate::config::Config;
use crate::cpulist;
use crate::dbus::UserManager;
use crate::procscan::Scanner;
use crate::state::{self, StateFile};
use crate::systemd::{unit_name_for_game_id, Systemctl};
use crate::topology;

const SESSION_SLICE: &str = "session.slice";

pub struct Daemon {
    config: Config,
    scanner: Scanner,
    manager: UserManager,
    systemctl: Systemctl,
    state: StateFile,
    state_path: PathBuf,
    dry_run: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        scanner: Scanner,
        manager: UserManager,
        systemctl: Systemctl,
        state: StateFile,
        state_path: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            scanner,
            manager,
            systemctl,
            state,
            state_path,
            dry_run,
        }
    }

    /// One scan/apply pass. Per-unit control-plane failures are logged and
    /// skipped; only evidence-gathering failures (topology, process table)
    /// fail the tick.
    pub async fn tick(&mut self) -> Result<()> {
        let (os_cpus, game_cpus) = self.resolve_cpusets()?;
        let groups = self.scanner.scan().context("process scan failed")?;

        let mut all_ok = true;
        let mut pinned_any = false;
        for (game_id, procs) in &groups {
            let unit = unit_name_for_game_id(game_id);
            let pids: Vec<i32> = procs.iter().map(|p| p.pid).collect();
            debug!("game {game_id:?}: unit {unit} pids {pids:?}");

            let description = format!("Game {game_id}");
            let created = match self
                .manager
                .ensure_transient_scope(&unit, &pids, "", &description)
                .await
            {
                Ok(created) => created,
                Err(err) => {
                    warn!("failed to ensure scope {unit}: {err:#}");
                    all_ok = false;
                    continue;
                }
            };
            if created {
                info!("created scope {unit} for game {game_id:?}");
            } else if let Err(err) = self.manager.attach_processes(&unit, "", &pids).await {
                warn!("failed to attach pids to {unit}: {err:#}");
                all_ok = false;
            }

            match self.pin_unit(&unit, &game_cpus).await {
                Ok(pinned) => pinned_any |= pinned,
                Err(err) => {
                    warn!("failed to pin {unit}: {err:#}");
                    all_ok = false;
                }
            }
        }

        let mut os_units: Vec<String> = Vec::new();
        if self.config.pin_session_slice {
            os_units.push(SESSION_SLICE.to_string());
        }
        os_units.extend(self.config.pin_slices.iter().cloned());
        for unit in &os_units {
            // Slices may not be active until something runs in them; starting
            // an active unit is a no-op.
            if let Err(err) = self.systemctl.start_unit(unit).await {
                debug!("start of {unit} failed (continuing): {err:#}");
            }
            match self.pin_unit(unit, &os_cpus).await {
                Ok(pinned) => pinned_any |= pinned,
                Err(err) => {
                    warn!("failed to pin {unit}: {err:#}");
                    all_ok = false;
                }
            }
        }

        if pinned_any || !self.state.original_allowed_cpus.is_empty() {
            self.state.pin_applied = true;
            self.state.os_cpus = os_cpus;
            self.state.game_cpus = game_cpus;
            if all_ok {
                self.state.last_successful_pin_apply = Some(Utc::now());
            }
            self.save_state()?;
        }
        Ok(())
    }

    /// Restore every recorded unit to its pre-pin `AllowedCPUs`. Units that
    /// fail stay recorded so a later attempt can still restore them.
    pub async fn restore(&mut self) -> Result<()> {
        let mut failed = 0usize;
        for (unit, original) in self.state.original_allowed_cpus.clone() {
            match self.systemctl.set_allowed_cpus(&unit, &original).await {
                Ok(()) => {
                    info!("restored {unit} to AllowedCPUs={original:?}");
                    self.state.original_allowed_cpus.remove(&unit);
                }
                Err(err) => {
                    warn!("failed to restore {unit}: {err:#}");
                    failed += 1;
                }
            }
        }
        if failed == 0 {
            self.state.pin_applied = false;
            self.state.last_successful_restore = Some(Utc::now());
        }
        self.save_state()?;
        if failed > 0 {
            bail!("failed to restore {failed} unit(s)");
        }
        Ok(())
    }

    /// Resolve the OS/game CPU sets: manual overrides win over detection.
    fn resolve_cpusets(&self) -> Result<(String, String)> {
        if !self.config.os_cpus.is_empty() && !self.config.game_cpus.is_empty() {
            let (os, _) = cpulist::canonicalize(&self.config.os_cpus)
                .context("invalid os_cpus override")?;
            let (game, _) = cpulist::canonicalize(&self.config.game_cpus)
                .context("invalid game_cpus override")?;
            return Ok((os, game));
        }
        let topo = topology::detect().context("topology detection failed")?;
        debug!("detected cache domains: {:?}", topo.lists);
        Ok((topo.os_cpus, topo.game_cpus))
    }

    /// Pin one unit, capturing its original affinity on disk before the
    /// first mutation. A failed affinity read aborts the pin for this unit
    /// without recording anything, so a transient read failure can never
    /// become a bogus restore target. Returns whether the affinity was (or,
    /// in dry-run, would have been) rewritten.
    async fn pin_unit(&mut self, unit: &str, cpus: &str) -> Result<bool> {
        let current = self
            .systemctl
            .get_allowed_cpus(unit)
            .await
            .with_context(|| format!("failed to read AllowedCPUs of {unit}"))?;
        if !self.state.original_allowed_cpus.contains_key(unit) {
            self.state
                .original_allowed_cpus
                .insert(unit.to_string(), current.clone());
            // The original value must hit the disk before the unit is
            // touched, or a crash here loses the restore target.
            self.save_state()?;
        }
        if current.trim() == cpus {
            return Ok(false);
        }
        self.systemctl.set_allowed_cpus(unit, cpus).await?;
        info!("pinned {unit} to AllowedCPUs={cpus}");
        Ok(true)
    }

    fn save_state(&mut self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        state::save(&self.state_path, &mut self.state)
    }

    pub fn state(&self) -> &StateFile {
        &self.state
    }
}
