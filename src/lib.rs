// SPDX-License-Identifier: GPL-2.0

//! ccd-gamed splits a multi-CCD CPU into an "OS" and a "game" cache domain
//! and steers detected game processes into transient systemd scopes whose
//! `AllowedCPUs` is constrained to the game domain.

pub mod config;
pub mod cpulist;
pub mod daemon;
pub mod dbus;
pub mod procscan;
pub mod state;
pub mod systemd;
pub mod topology;
