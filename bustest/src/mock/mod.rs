//! Mock bus services backed by python-dbusmock.
//!
//! A [`MockTask`] owns a well-known bus name and a registry of mock objects.
//! The test declares properties and methods on it at any time: before the
//! backend is up they are queued, afterwards they are applied immediately.
//!
//! ```no_run
//! # async fn demo() -> Result<(), bustest::BusTestError> {
//! use bustest::{MockTask, Service, ServiceConfig, Value};
//! use std::time::Duration;
//!
//! let mock = MockTask::new("foo.test")?;
//! let obj = mock.get_object("/test", "foo.test.interface").await?;
//! mock.add_property(&obj, "prop1", "s", Value::from("test")).await?;
//! mock.add_method(&obj, "method1", "s", "s", "ret = 'test'").await?;
//!
//! let mut service = Service::new(ServiceConfig::default())?;
//! service.add_task(mock.clone())?;
//! service.start_and_wait(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod control;
mod registry;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bustest_core::names::validate_bus_name;
use bustest_core::{TaskName, TaskState, Value};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::config::BusType;
use crate::error::{BusTestError, TaskFailure};
use crate::task::monitor::{self, LaunchSpec, Monitor};
use crate::task::process::stop_monitored;
use crate::task::{BusTask, TaskContext, TaskStatus};

pub use control::{DbusMockControl, MethodCall, MockControl};
pub use registry::{MockObject, PendingOperation};
use registry::Registry;

/// A task that runs a generic mock service under a well-known bus name.
///
/// Cloning is cheap and all clones refer to the same task and registry.
#[derive(Clone)]
pub struct MockTask {
    inner: Arc<MockInner>,
}

struct MockInner {
    status: Arc<TaskStatus>,
    bus_name: String,
    registry: Arc<tokio::sync::Mutex<Registry>>,
    ready_timeout: Mutex<Option<Duration>>,
    monitor: Mutex<Option<Monitor>>,
}

impl std::fmt::Debug for MockTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTask")
            .field("bus_name", &self.inner.bus_name)
            .field("state", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

impl MockTask {
    /// A mock that will own `bus_name` once started.
    pub fn new(bus_name: impl Into<String>) -> Result<Self, BusTestError> {
        let bus_name = bus_name.into();
        validate_bus_name(&bus_name)?;
        Ok(Self {
            inner: Arc::new(MockInner {
                status: Arc::new(TaskStatus::new(TaskName::new(bus_name.clone()))),
                bus_name,
                registry: Arc::new(tokio::sync::Mutex::new(Registry::new())),
                ready_timeout: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        })
    }

    pub fn bus_name(&self) -> &str {
        &self.inner.bus_name
    }

    /// Put the task in Error if the backend is not up within `limit`.
    pub fn set_ready_timeout(&self, limit: Duration) {
        *self.inner.ready_timeout.lock() = Some(limit);
    }

    /// Handle for the object at `path` implementing `interface`.
    ///
    /// Idempotent and purely local.
    pub async fn get_object(&self, path: &str, interface: &str) -> Result<MockObject, BusTestError> {
        self.inner.registry.lock().await.object(path, interface)
    }

    /// Declare a property of type `signature` with an initial value.
    ///
    /// Fails with a type mismatch, storing nothing, if `value` does not have
    /// the declared type.
    pub async fn add_property(
        &self,
        object: &MockObject,
        name: &str,
        signature: &str,
        value: Value,
    ) -> Result<(), BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .add_property(object, name, signature, value)
            .await
    }

    /// Declare a method. `behavior` is python code run by the backend on
    /// each call; it may set `ret` to produce the return value.
    pub async fn add_method(
        &self,
        object: &MockObject,
        name: &str,
        in_signature: &str,
        out_signature: &str,
        behavior: &str,
    ) -> Result<(), BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .add_method(object, name, in_signature, out_signature, behavior)
            .await
    }

    /// Change the value of a declared property.
    pub async fn set_property(
        &self,
        object: &MockObject,
        name: &str,
        value: Value,
    ) -> Result<(), BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .set_property(object, name, value)
            .await
    }

    /// Current local value of a property.
    pub async fn property(&self, object: &MockObject, name: &str) -> Option<Value> {
        self.inner.registry.lock().await.property(object, name)
    }

    pub async fn has_method(&self, object: &MockObject, name: &str) -> bool {
        self.inner.registry.lock().await.has_method(object, name)
    }

    /// False once a queued declaration for `object` was rejected.
    pub async fn is_consistent(&self, object: &MockObject) -> bool {
        self.inner.registry.lock().await.is_consistent(object)
    }

    /// Declarations still waiting for the backend, in replay order.
    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.registry.lock().await.pending_operations()
    }

    pub async fn emit_signal(
        &self,
        object: &MockObject,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> Result<(), BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .emit_signal(object, name, signature, args)
            .await
    }

    /// Calls recorded by the backend for `method`, oldest first.
    pub async fn method_calls(
        &self,
        object: &MockObject,
        method: &str,
    ) -> Result<Vec<MethodCall>, BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .method_calls(object, method)
            .await
    }

    /// Whether `method` has been called with exactly `args`.
    pub async fn check_method_call(
        &self,
        object: &MockObject,
        method: &str,
        args: &[Value],
    ) -> Result<bool, BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .check_method_call(object, method, args)
            .await
    }

    pub async fn clear_method_calls(&self, object: &MockObject) -> Result<(), BusTestError> {
        self.inner
            .registry
            .lock()
            .await
            .clear_method_calls(object)
            .await
    }

    fn launch_spec(&self, ctx: &TaskContext) -> LaunchSpec {
        let mut spec = LaunchSpec::new(ctx.mock_backend.python.clone());
        spec.args = vec!["-m".to_string(), ctx.mock_backend.module.clone()];
        if ctx.bus_type == BusType::System {
            spec.args.push("--system".to_string());
        }
        spec.args.extend([
            self.inner.bus_name.clone(),
            "/".to_string(),
            control::ROOT_INTERFACE.to_string(),
        ]);
        spec.wait_for = Some(self.inner.bus_name.clone());
        spec.ready_timeout = *self.inner.ready_timeout.lock();

        let registry = Arc::clone(&self.inner.registry);
        let destination = self.inner.bus_name.clone();
        spec.on_ready = Some(Box::new(move |connection: zbus::Connection| {
            async move {
                let control: Arc<dyn MockControl> =
                    Arc::new(DbusMockControl::new(connection, destination));
                registry.lock().await.attach(control).await
            }
            .boxed()
        }));

        let registry = Arc::clone(&self.inner.registry);
        spec.on_exit = Some(Box::new(move |requested: bool| {
            async move {
                registry.lock().await.detach(requested);
            }
            .boxed()
        }));
        spec
    }
}

#[async_trait]
impl BusTask for MockTask {
    fn name(&self) -> &TaskName {
        self.inner.status.name()
    }

    fn state(&self) -> TaskState {
        self.inner.status.get()
    }

    fn failure(&self) -> Option<TaskFailure> {
        self.inner.status.failure()
    }

    async fn start(&self, ctx: TaskContext) -> Result<(), BusTestError> {
        let spec = self.launch_spec(&ctx);
        let handle = monitor::launch(&self.inner.status, &ctx, spec)?;
        *self.inner.monitor.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<TaskState, BusTestError> {
        stop_monitored(&self.inner.status, &self.inner.monitor, grace).await
    }
}
