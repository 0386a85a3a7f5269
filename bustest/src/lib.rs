//! bustest - Private message bus test harness.
//!
//! Runs a private `dbus-daemon`, launches the processes under test and
//! programmable mock services against it, and tracks every one of them
//! through a small lifecycle state machine.
//!
//! Key types:
//! - [`Service`] - Owns the bus and the task set; `start_tasks`,
//!   `wait_for_running`, `shutdown`
//! - [`BusTask`] - Capability set shared by all task kinds
//! - [`ProcessTask`] - An arbitrary program, optionally ready on a bus name
//! - [`MockTask`] - A python-dbusmock backend with a declarative registry
//! - [`ServiceConfig`] - Layered configuration (defaults, TOML, environment)
//! - [`BusTestError`] / [`ErrorKind`] - Error taxonomy
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::redundant_clone
    )
)]

pub mod bus;
mod child;
pub mod config;
pub mod error;
pub mod mock;
pub mod readiness;
pub mod service;
pub mod task;

pub use bus::BusHandle;
pub use config::{BusConfig, BusType, MockBackendConfig, ServiceConfig};
pub use error::{BusTestError, ErrorKind, Result, TaskFailure};
pub use mock::{MethodCall, MockControl, MockObject, MockTask, PendingOperation};
pub use readiness::{TransitionNotifier, WaitOutcome};
pub use service::Service;
pub use task::process::{ProcessTask, ProcessTaskBuilder};
pub use task::{BusTask, ReturnPolicy, TaskContext, TaskPriority, TaskStatus};

pub use bustest_core::{DataType, Signature, TaskName, TaskState, Value};
