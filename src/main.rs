// SPDX-License-Identifier: GPL-2.0

mod logger;

use std::path::PathBuf;

use anyhow::{Context, Result};
use ccd_gamed::config::Config;
use ccd_gamed::daemon::Daemon;
use ccd_gamed::dbus::UserManager;
use ccd_gamed::procscan::Scanner;
use ccd_gamed::state;
use ccd_gamed::systemd::Systemctl;
use clap::Parser;
use log::{error, info, warn};

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opts {
    /// Path to the config file (default: $XDG_CONFIG_HOME/ccd-gamed/config.toml).
    #[clap(long)]
    config: Option<PathBuf>,

    /// Log intended mutations without touching the system.
    #[clap(long, action)]
    dry_run: bool,

    /// Run a single scan/apply tick and exit, leaving pins applied.
    #[clap(long, action)]
    once: bool,

    /// Restore original affinities from the state file and exit.
    #[clap(long, action)]
    restore: bool,

    /// Increase log verbosity.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    logger::init(opts.verbose)?;

    let config = Config::load(opts.config.as_deref()).context("failed to load config")?;
    let interval = config.interval;

    let uid = nix::unistd::Uid::effective().as_raw();
    let scanner = Scanner::new(
        uid,
        &config.env_keys,
        &config.exe_allowlist,
        &config.ignore_exe,
    );
    let manager = UserManager::connect(opts.dry_run).await?;
    let systemctl = Systemctl::new(opts.dry_run);

    let state_path = state::default_path()?;
    let loaded = state::load(&state_path)
        .with_context(|| format!("failed to load state from {}", state_path.display()))?;
    let stale_pin = loaded.pin_applied;

    let mut daemon = Daemon::new(
        config,
        scanner,
        manager,
        systemctl,
        loaded,
        state_path,
        opts.dry_run,
    );

    if opts.restore {
        return daemon.restore().await;
    }

    if stale_pin {
        info!("state file reports an applied pin, restoring before pinning anew");
        if let Err(err) = daemon.restore().await {
            warn!("restore of stale pin failed: {err:#}");
        }
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.once {
        return daemon.tick().await;
    }

    info!("scanning every {interval:?} (dry-run: {})", opts.dry_run);
    loop {
        if let Err(err) = daemon.tick().await {
            error!("tick failed: {err:#}");
        }
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("shutting down, restoring original affinities");
    daemon.restore().await
}
