#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Command, Stdio};

use bustest::{Service, ServiceConfig};

/// Private bus configuration shipped with the tests.
pub fn session_conf() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join("session.conf")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Config from the environment with a short shutdown grace.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::from_env().expect("BUSTEST_* overrides must be valid");
    config.shutdown_grace_ms = 1_000;
    config
}

/// A service on a private bus, or `None` when `dbus-daemon` is missing.
pub fn skip_if_no_bus() -> Option<Service> {
    init_tracing();
    let config = test_config();
    if which::which(&config.bus.daemon).is_err() {
        eprintln!("Skipping: {} not found on PATH.", config.bus.daemon);
        return None;
    }
    let mut service = Service::new(config).expect("test config must be valid");
    service
        .set_conf_file(session_conf())
        .expect("bundled session.conf must exist");
    Some(service)
}

/// Like [`skip_if_no_bus`], additionally requiring python-dbusmock.
pub fn skip_if_no_dbusmock() -> Option<Service> {
    let service = skip_if_no_bus()?;
    let mock = &service.config().mock;
    let available = Command::new(&mock.python)
        .args(["-c", &format!("import {}", mock.module)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success());
    if available {
        Some(service)
    } else {
        eprintln!(
            "Skipping: python module '{}' not importable with {}.",
            mock.module, mock.python
        );
        None
    }
}

fn fixture_path(bin: &str) -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let workspace_root = PathBuf::from(manifest_dir).parent().unwrap().to_path_buf();
    workspace_root.join("target").join("debug").join(bin)
}

fn built_fixture(bin: &str) -> Option<PathBuf> {
    let path = fixture_path(bin);
    if path.exists() {
        Some(path)
    } else {
        eprintln!("Skipping: {bin} not built. Run `cargo build -p {bin}` first.");
        None
    }
}

/// Path to the fixture binary, or `None` when it has not been built.
pub fn skip_if_no_bus_name_holder() -> Option<PathBuf> {
    built_fixture("bus-name-holder")
}

/// A service whose mock backend is the `mock-backend-stub` fixture, so mock
/// tasks run without python-dbusmock.
pub fn skip_if_no_mock_backend_stub() -> Option<Service> {
    let service = skip_if_no_bus()?;
    let stub = built_fixture("mock-backend-stub")?;
    let mut config = service.config().clone();
    config.mock.python = stub.to_string_lossy().into_owned();
    Some(Service::new(config).expect("test config must be valid"))
}
