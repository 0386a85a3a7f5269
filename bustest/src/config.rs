//! Harness configuration.
//!
//! Layered: defaults → TOML (optional) → environment overrides. Environment
//! lookup is injected so tests never touch the process-wide environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusTestError;

/// Which bus the private instance stands in for.
///
/// The private daemon is always session-style; this only decides which
/// address variables launched tasks see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    #[default]
    Session,
    System,
}

impl BusType {
    /// Environment variable a client library reads to find this bus.
    pub fn address_variable(self) -> &'static str {
        match self {
            Self::Session => "DBUS_SESSION_BUS_ADDRESS",
            Self::System => "DBUS_SYSTEM_BUS_ADDRESS",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::System => "system",
        }
    }
}

/// Settings for the private bus daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub bus_type: BusType,
    /// Daemon configuration file; `None` uses the daemon's session defaults.
    pub conf_file: Option<PathBuf>,
    /// Daemon executable.
    pub daemon: String,
    /// How long to wait for the daemon to print its address.
    pub startup_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::Session,
            conf_file: None,
            daemon: "dbus-daemon".to_string(),
            startup_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Command used to run the generic mock backend.
///
/// Mock tasks run `<python> -m <module> [--system] <bus name> / org.bustest.Mock`;
/// any program accepting that command line can stand in for python-dbusmock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockBackendConfig {
    pub python: String,
    pub module: String,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            module: "dbusmock".to_string(),
        }
    }
}

/// Complete configuration for a [`Service`](crate::Service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bus: BusConfig,
    pub mock: MockBackendConfig,
    /// Time a task gets to exit after SIGTERM before it is killed.
    pub shutdown_grace_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            mock: MockBackendConfig::default(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, BusTestError> {
        toml::from_str(text).map_err(|e| BusTestError::ConfigInvalid(e.to_string()))
    }

    /// Read a TOML file.
    pub async fn from_file(path: &Path) -> Result<Self, BusTestError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            BusTestError::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self, BusTestError> {
        let mut config = Self::default();
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Use a private bus configuration file instead of the session defaults.
    pub fn with_conf_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.bus.conf_file = Some(path.into());
        self
    }

    pub fn with_bus_type(mut self, bus_type: BusType) -> Self {
        self.bus.bus_type = bus_type;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Apply `BUSTEST_*` overrides using the given lookup.
    pub fn apply_env_overrides_from<F>(&mut self, mut env: F) -> Result<(), BusTestError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(daemon) = env("BUSTEST_DBUS_DAEMON") {
            self.bus.daemon = daemon;
        }
        if let Some(conf) = env("BUSTEST_BUS_CONF") {
            self.bus.conf_file = Some(PathBuf::from(conf));
        }
        if let Some(python) = env("BUSTEST_PYTHON") {
            self.mock.python = python;
        }
        if let Some(grace) = env("BUSTEST_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = grace.trim().parse().map_err(|e| {
                BusTestError::ConfigInvalid(format!(
                    "BUSTEST_SHUTDOWN_GRACE_MS must be milliseconds: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Reject configurations that cannot possibly start a bus.
    pub fn validate(&self) -> Result<(), BusTestError> {
        if self.bus.daemon.trim().is_empty() {
            return Err(BusTestError::ConfigInvalid(
                "bus daemon program is empty".to_string(),
            ));
        }
        if self.mock.python.trim().is_empty() || self.mock.module.trim().is_empty() {
            return Err(BusTestError::ConfigInvalid(
                "mock backend command is empty".to_string(),
            ));
        }
        if self.bus.startup_timeout_ms == 0 {
            return Err(BusTestError::ConfigInvalid(
                "bus startup timeout must be non-zero".to_string(),
            ));
        }
        if let Some(conf) = &self.bus.conf_file {
            validate_conf_file(conf)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_conf_file(path: &Path) -> Result<(), BusTestError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BusTestError::ConfigInvalid(format!(
            "bus configuration file {} does not exist",
            path.display()
        )))
    }
}
