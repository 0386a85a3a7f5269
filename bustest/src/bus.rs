//! The private bus instance.
//!
//! A [`BusHandle`] owns one `dbus-daemon` child. Everything else refers to
//! the bus by its address only.

use std::process::Stdio;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use zbus::names::BusName;

use crate::child::{self, Termination};
use crate::config::{BusConfig, BusType};
use crate::error::BusTestError;

/// Handle to a running private bus daemon.
pub struct BusHandle {
    address: String,
    bus_type: BusType,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("address", &self.address)
            .field("bus_type", &self.bus_type)
            .finish_non_exhaustive()
    }
}

impl BusHandle {
    /// Start a daemon and wait until it has printed its address.
    pub async fn launch(config: &BusConfig) -> Result<Self, BusTestError> {
        let mut command = Command::new(&config.daemon);
        command.arg("--nofork").arg("--print-address");
        match &config.conf_file {
            Some(path) => {
                command.arg(format!("--config-file={}", path.display()));
            }
            None => {
                command.arg("--session");
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            BusTestError::BusLaunch(format!("failed to spawn '{}': {e}", config.daemon))
        })?;

        if let Some(stderr) = child.stderr.take() {
            child::forward_lines(stderr, "dbus-daemon".to_string(), "stderr");
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BusTestError::BusLaunch("daemon stdout not captured".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let first = tokio::time::timeout(config.startup_timeout(), lines.next_line()).await;
        let address = match first {
            Ok(Ok(Some(line))) if !line.trim().is_empty() => line.trim().to_string(),
            Ok(Ok(_)) => {
                let status = child.try_wait().ok().flatten();
                return Err(BusTestError::BusLaunch(format!(
                    "daemon exited without printing an address (status {status:?})"
                )));
            }
            Ok(Err(e)) => {
                return Err(BusTestError::BusLaunch(format!(
                    "failed to read daemon address: {e}"
                )));
            }
            Err(_) => {
                return Err(BusTestError::BusLaunch(format!(
                    "daemon did not print an address within {:?}",
                    config.startup_timeout()
                )));
            }
        };

        tracing::info!(
            address = %address,
            pid = ?child.id(),
            bus_type = config.bus_type.as_str(),
            "private bus started"
        );

        Ok(Self {
            address,
            bus_type: config.bus_type,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn bus_type(&self) -> BusType {
        self.bus_type
    }

    /// Variables a client process needs to find this bus as its
    /// session or system bus.
    pub fn environment(&self) -> Vec<(String, String)> {
        bus_environment(&self.address, self.bus_type)
    }

    /// Open a new client connection to the bus.
    pub async fn connect(&self) -> Result<zbus::Connection, BusTestError> {
        connect(&self.address).await
    }

    /// Whether [`shutdown`](Self::shutdown) has already run.
    pub async fn is_shut_down(&self) -> bool {
        self.child.lock().await.is_none()
    }

    /// Terminate the daemon. Safe to call more than once.
    pub async fn shutdown(&self, grace: std::time::Duration) -> Result<(), BusTestError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        match child::terminate(&mut child, grace).await {
            Ok(Termination::Graceful(status)) => {
                tracing::info!(address = %self.address, %status, "private bus stopped");
            }
            Ok(Termination::Forced) => {
                tracing::warn!(address = %self.address, "private bus killed after grace period");
            }
            Err(e) => {
                return Err(BusTestError::BackendUnreachable(format!(
                    "failed to stop bus daemon: {e}"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn bus_environment(address: &str, bus_type: BusType) -> Vec<(String, String)> {
    vec![
        (bus_type.address_variable().to_string(), address.to_string()),
        ("DBUS_STARTER_ADDRESS".to_string(), address.to_string()),
        (
            "DBUS_STARTER_BUS_TYPE".to_string(),
            bus_type.as_str().to_string(),
        ),
    ]
}

pub(crate) async fn connect(address: &str) -> Result<zbus::Connection, BusTestError> {
    let connection = zbus::connection::Builder::address(address)?.build().await?;
    Ok(connection)
}

/// Resolve once `name` has an owner on the bus.
///
/// Subscribes to `NameOwnerChanged` before asking `NameHasOwner`, so an
/// owner that appears in between is not missed.
pub(crate) async fn wait_for_name(
    connection: &zbus::Connection,
    name: &str,
) -> Result<(), BusTestError> {
    let bus_name = BusName::try_from(name).map_err(zbus::Error::from)?;
    let proxy = zbus::fdo::DBusProxy::new(connection).await?;
    let mut changes = proxy.receive_name_owner_changed().await?;

    let owned = proxy
        .name_has_owner(bus_name)
        .await
        .map_err(|e| BusTestError::BackendUnreachable(format!("NameHasOwner failed: {e}")))?;
    if owned {
        return Ok(());
    }

    while let Some(signal) = changes.next().await {
        let Ok(args) = signal.args() else {
            continue;
        };
        if args.name().as_str() == name && args.new_owner().is_some() {
            return Ok(());
        }
    }
    Err(BusTestError::BackendUnreachable(format!(
        "bus closed while waiting for '{name}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_session_environment() {
        let env = bus_environment("unix:path=/tmp/bus", BusType::Session);
        assert!(env.contains(&(
            "DBUS_SESSION_BUS_ADDRESS".to_string(),
            "unix:path=/tmp/bus".to_string()
        )));
        assert!(env.contains(&("DBUS_STARTER_BUS_TYPE".to_string(), "session".to_string())));
    }

    #[test]
    fn test_system_environment() {
        let env = bus_environment("unix:path=/tmp/bus", BusType::System);
        assert!(env.iter().any(|(k, _)| k == "DBUS_SYSTEM_BUS_ADDRESS"));
        assert!(!env.iter().any(|(k, _)| k == "DBUS_SESSION_BUS_ADDRESS"));
    }

    #[tokio::test]
    async fn test_launch_missing_daemon_fails() {
        let config = BusConfig {
            daemon: "/nonexistent/bustest-dbus-daemon".to_string(),
            ..BusConfig::default()
        };
        let err = BusHandle::launch(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_daemon_that_prints_nothing_fails() {
        // `true` accepts any arguments and exits without output.
        let config = BusConfig {
            daemon: "true".to_string(),
            ..BusConfig::default()
        };
        let err = BusHandle::launch(&config).await.unwrap_err();
        assert!(matches!(err, BusTestError::BusLaunch(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_reads_address_and_shutdown_is_idempotent() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let daemon = dir.path().join("fake-dbus-daemon");
        std::fs::write(
            &daemon,
            "#!/bin/sh\necho unix:path=/nonexistent/bustest-bus\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&daemon, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = BusConfig {
            daemon: daemon.to_string_lossy().into_owned(),
            ..BusConfig::default()
        };

        let bus = BusHandle::launch(&config).await.unwrap();
        assert_eq!(bus.address(), "unix:path=/nonexistent/bustest-bus");
        assert_eq!(bus.bus_type(), BusType::Session);
        assert!(!bus.is_shut_down().await);

        bus.shutdown(std::time::Duration::from_secs(5)).await.unwrap();
        assert!(bus.is_shut_down().await);
        bus.shutdown(std::time::Duration::from_secs(5)).await.unwrap();
        assert!(bus.is_shut_down().await);
    }
}
