// SPDX-License-Identifier: GPL-2.0

//! systemd user-manager D-Bus adapter.
//!
//! Transient scope creation and PID attachment go over the bus because
//! `StartTransientUnit` creates the scope and adopts the initial PIDs in one
//! atomic call, and because the `UnitExists` fault is distinguishable from
//! other failures (repeated creation must converge, not error).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

const DBUS_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_GAME_SLICE: &str = "game.slice";

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
pub trait SystemdManager {
    /// StartTransientUnit(s name, s mode, a(sv) properties, a(sa(sv)) aux).
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, Vec<(&str, Value<'_>)>)],
    ) -> zbus::Result<OwnedObjectPath>;

    /// AttachProcessesToUnit(s unit, s subcgroup, au pids).
    fn attach_processes_to_unit(
        &self,
        unit_name: &str,
        subcgroup: &str,
        pids: &[u32],
    ) -> zbus::Result<()>;
}

/// Manages transient scopes on the user service manager. In dry-run mode no
/// bus connection is made and every operation only logs its intent.
pub struct UserManager {
    dry_run: bool,
    proxy: Option<SystemdManagerProxy<'static>>,
}

impl UserManager {
    pub async fn connect(dry_run: bool) -> Result<Self> {
        if dry_run {
            return Ok(Self {
                dry_run: true,
                proxy: None,
            });
        }
        let conn = connect_user_bus()
            .await
            .context("failed to connect to the user session bus")?;
        let proxy = SystemdManagerProxy::new(&conn)
            .await
            .context("failed to create systemd manager proxy")?;
        Ok(Self {
            dry_run: false,
            proxy: Some(proxy),
        })
    }

    /// Create a transient scope (if missing) and attach the given PIDs.
    /// Safe to call repeatedly: an existing unit reports `created=false`
    /// instead of an error.
    pub async fn ensure_transient_scope(
        &self,
        scope_name: &str,
        pids: &[i32],
        slice: &str,
        description: &str,
    ) -> Result<bool> {
        if !scope_name.ends_with(".scope") {
            bail!("scope name must end with .scope: {scope_name:?}");
        }
        if self.dry_run {
            info!("dry-run: StartTransientUnit({scope_name:?}) slice={slice:?} pids={pids:?}");
            return Ok(true);
        }
        let Some(proxy) = &self.proxy else {
            bail!("no dbus connection");
        };

        let slice = if slice.trim().is_empty() {
            DEFAULT_GAME_SLICE
        } else {
            slice
        };
        let pids_u32 = filter_pids(pids);

        let props = vec![
            ("Description", Value::from(description)),
            ("Slice", Value::from(slice)),
            ("PIDs", Value::from(pids_u32)),
        ];
        let call = proxy.start_transient_unit(scope_name, "fail", &props, &[]);
        match tokio::time::timeout(DBUS_TIMEOUT, call)
            .await
            .with_context(|| format!("StartTransientUnit({scope_name}) timed out"))?
        {
            Ok(_) => Ok(true),
            Err(err) if is_unit_exists_error(&err) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("StartTransientUnit({scope_name})")),
        }
    }

    /// Attach PIDs to an existing unit. A no-op on an empty PID list, even
    /// in dry-run mode, so logs only show calls that would go on the bus.
    pub async fn attach_processes(
        &self,
        unit: &str,
        subcgroup: &str,
        pids: &[i32],
    ) -> Result<()> {
        if pids.is_empty() {
            return Ok(());
        }
        if self.dry_run {
            info!("dry-run: AttachProcessesToUnit({unit:?}, {subcgroup:?}) pids={pids:?}");
            return Ok(());
        }
        let Some(proxy) = &self.proxy else {
            bail!("no dbus connection");
        };
        let pids_u32 = filter_pids(pids);

        let call = proxy.attach_processes_to_unit(unit, subcgroup, &pids_u32);
        tokio::time::timeout(DBUS_TIMEOUT, call)
            .await
            .with_context(|| format!("AttachProcessesToUnit({unit}) timed out"))?
            .with_context(|| format!("AttachProcessesToUnit({unit})"))?;
        Ok(())
    }
}

fn filter_pids(pids: &[i32]) -> Vec<u32> {
    pids.iter()
        .filter(|&&pid| pid > 0)
        .map(|&pid| pid as u32)
        .collect()
}

fn is_unit_exists_error(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::MethodError(name, _, _) => name.as_str().contains("UnitExists"),
        _ => false,
    }
}

/// Connect to the user session bus, falling back to the well-known per-user
/// socket when `DBUS_SESSION_BUS_ADDRESS` is not exported (e.g. when started
/// from a non-login context).
async fn connect_user_bus() -> Result<Connection> {
    if std::env::var("DBUS_SESSION_BUS_ADDRESS").is_ok() {
        if let Ok(conn) = Connection::session().await {
            return Ok(conn);
        }
    }

    let addr = match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) => format!("unix:path={runtime_dir}/bus"),
        Err(_) => format!(
            "unix:path=/run/user/{}/bus",
            nix::unistd::Uid::effective().as_raw()
        ),
    };
    let conn = zbus::connection::Builder::address(addr.as_str())?
        .build()
        .await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_error(name: &str) -> zbus::Error {
        let msg = zbus::message::Message::method_call(
            "/org/freedesktop/systemd1",
            "StartTransientUnit",
        )
        .unwrap()
        .build(&())
        .unwrap();
        zbus::Error::MethodError(name.try_into().unwrap(), None, msg)
    }

    #[test]
    fn test_unit_exists_fault_classified_as_success() {
        // Repeated scope creation converges on created=false, so the
        // UnitExists fault must be told apart from genuine failures.
        assert!(is_unit_exists_error(&method_error(
            "org.freedesktop.systemd1.UnitExists"
        )));
        assert!(!is_unit_exists_error(&method_error(
            "org.freedesktop.DBus.Error.Failed"
        )));
        assert!(!is_unit_exists_error(&zbus::Error::InvalidReply));
    }

    #[tokio::test]
    async fn test_dry_run_ensure_reports_created() {
        let mgr = UserManager::connect(true).await.unwrap();
        for _ in 0..2 {
            let created = mgr
                .ensure_transient_scope("game-1.scope", &[123], "", "Game 1")
                .await
                .unwrap();
            assert!(created);
        }
    }

    #[tokio::test]
    async fn test_scope_suffix_validated_before_transport() {
        let mgr = UserManager::connect(true).await.unwrap();
        let err = mgr
            .ensure_transient_scope("game-1.service", &[123], "", "Game 1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".scope"));
    }

    #[tokio::test]
    async fn test_dry_run_attach_is_noop() {
        let mgr = UserManager::connect(true).await.unwrap();
        mgr.attach_processes("game-1.scope", "", &[1, 2])
            .await
            .unwrap();
        mgr.attach_processes("game-1.scope", "", &[]).await.unwrap();
    }

    #[test]
    fn test_filter_pids() {
        assert_eq!(filter_pids(&[0, -1, 5, 7]), vec![5, 7]);
    }
}
