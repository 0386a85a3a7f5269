//! A task that runs an arbitrary program against the private bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bustest_core::{TaskName, TaskState};
use bustest_core::names::validate_bus_name;
use parking_lot::Mutex;

use super::monitor::{self, LaunchSpec, Monitor};
use super::{BusTask, ReturnPolicy, TaskContext, TaskStatus};
use crate::error::{BusTestError, TaskFailure};

/// A program launched with the private bus in its environment.
///
/// Without a wait-for name it is Running as soon as it is spawned; with one,
/// it becomes Running when that name gains an owner on the bus.
///
/// Cloning is cheap and all clones refer to the same task.
#[derive(Clone)]
pub struct ProcessTask {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    status: Arc<TaskStatus>,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    wait_for: Option<String>,
    return_policy: ReturnPolicy,
    ready_timeout: Option<Duration>,
    monitor: Mutex<Option<Monitor>>,
}

impl std::fmt::Debug for ProcessTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTask")
            .field("name", self.inner.status.name())
            .field("program", &self.inner.program)
            .field("state", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

impl ProcessTask {
    pub fn builder(program: impl Into<String>) -> ProcessTaskBuilder {
        ProcessTaskBuilder::new(program)
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }

    pub fn wait_for(&self) -> Option<&str> {
        self.inner.wait_for.as_deref()
    }
}

#[async_trait]
impl BusTask for ProcessTask {
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
        let inner = &self.inner;
        let mut spec = LaunchSpec::new(inner.program.clone());
        spec.args = inner.args.clone();
        spec.env = inner.env.clone();
        spec.wait_for = inner.wait_for.clone();
        spec.return_policy = inner.return_policy;
        spec.ready_timeout = inner.ready_timeout;

        let handle = monitor::launch(&inner.status, &ctx, spec)?;
        *inner.monitor.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<TaskState, BusTestError> {
        stop_monitored(&self.inner.status, &self.inner.monitor, grace).await
    }
}

/// Shared `stop` for monitor-backed tasks.
pub(crate) async fn stop_monitored(
    status: &TaskStatus,
    monitor: &Mutex<Option<Monitor>>,
    grace: Duration,
) -> Result<TaskState, BusTestError> {
    let handle = monitor.lock().take();
    match handle {
        Some(handle) => handle.stop(grace).await,
        None => {
            if status.get() == TaskState::NotStarted {
                status.advance(TaskState::Finished)?;
            }
        }
    }
    Ok(status.get())
}

/// Builder for [`ProcessTask`].
#[derive(Debug)]
pub struct ProcessTaskBuilder {
    name: Option<String>,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    wait_for: Option<String>,
    return_policy: ReturnPolicy,
    ready_timeout: Option<Duration>,
}

impl ProcessTaskBuilder {
    fn new(program: impl Into<String>) -> Self {
        Self {
            name: None,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            wait_for: None,
            return_policy: ReturnPolicy::default(),
            ready_timeout: None,
        }
    }

    /// Name used in logs and failure reports. Defaults to the program.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Consider the task Running once `bus_name` is owned on the bus.
    pub fn wait_for(mut self, bus_name: impl Into<String>) -> Self {
        self.wait_for = Some(bus_name.into());
        self
    }

    pub fn return_policy(mut self, policy: ReturnPolicy) -> Self {
        self.return_policy = policy;
        self
    }

    /// Put the task in Error if it is not Running within `limit`.
    pub fn ready_timeout(mut self, limit: Duration) -> Self {
        self.ready_timeout = Some(limit);
        self
    }

    pub fn build(self) -> Result<ProcessTask, BusTestError> {
        if self.program.trim().is_empty() {
            return Err(BusTestError::ConfigInvalid(
                "process task program is empty".to_string(),
            ));
        }
        if let Some(name) = &self.wait_for {
            validate_bus_name(name)?;
        }
        let name = TaskName::new(self.name.unwrap_or_else(|| self.program.clone()));
        Ok(ProcessTask {
            inner: Arc::new(ProcessInner {
                status: Arc::new(TaskStatus::new(name)),
                program: self.program,
                args: self.args,
                env: self.env,
                wait_for: self.wait_for,
                return_policy: self.return_policy,
                ready_timeout: self.ready_timeout,
                monitor: Mutex::new(None),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusType, MockBackendConfig};
    use crate::error::ErrorKind;
    use crate::readiness::TransitionNotifier;

    fn context() -> TaskContext {
        TaskContext {
            // Never dialled by tasks without a wait-for name.
            bus_address: "unix:path=/nonexistent/bustest-bus".to_string(),
            bus_type: BusType::Session,
            notifier: TransitionNotifier::new(),
            mock_backend: MockBackendConfig::default(),
        }
    }

    async fn wait_until_terminal(task: &ProcessTask) -> TaskState {
        for _ in 0..200 {
            let state = task.state();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.state()
    }

    #[test]
    fn test_builder_records_launch_details() {
        let task = ProcessTask::builder("bus-name-holder")
            .wait_for("org.bustest.Holder")
            .build()
            .unwrap();
        assert_eq!(task.program(), "bus-name-holder");
        assert_eq!(task.wait_for(), Some("org.bustest.Holder"));
        assert_eq!(ProcessTask::builder("true").build().unwrap().wait_for(), None);
    }

    #[test]
    fn test_builder_rejects_bad_wait_name() {
        let err = ProcessTask::builder("true")
            .wait_for("not a bus name")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDeclaration);
    }

    #[test]
    fn test_name_defaults_to_program() {
        let task = ProcessTask::builder("sleep").build().unwrap();
        assert_eq!(task.name().as_str(), "sleep");
        assert_eq!(task.state(), TaskState::NotStarted);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failed() {
        let task = ProcessTask::builder("/nonexistent/bustest-program")
            .build()
            .unwrap();
        let err = task.start(context()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
        assert_eq!(task.state(), TaskState::Error);
        assert_eq!(task.failure().unwrap().kind, ErrorKind::LaunchFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_wait_name_runs_immediately_and_stops_cleanly() {
        let task = ProcessTask::builder("sleep").arg("30").build().unwrap();
        task.start(context()).await.unwrap();
        assert_eq!(task.state(), TaskState::Running);

        let state = task.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, TaskState::Finished);
        // Second stop is a no-op.
        assert_eq!(task.stop(Duration::from_secs(5)).await.unwrap(), TaskState::Finished);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_follows_return_policy() {
        let failing = ProcessTask::builder("false").build().unwrap();
        failing.start(context()).await.unwrap();
        assert_eq!(wait_until_terminal(&failing).await, TaskState::Error);

        let inverted = ProcessTask::builder("false")
            .return_policy(ReturnPolicy::Invert)
            .build()
            .unwrap();
        inverted.start(context()).await.unwrap();
        assert_eq!(wait_until_terminal(&inverted).await, TaskState::Finished);
    }

    #[tokio::test]
    async fn test_stop_before_start_finishes() {
        let task = ProcessTask::builder("true").build().unwrap();
        assert_eq!(
            task.stop(Duration::from_millis(10)).await.unwrap(),
            TaskState::Finished
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_twice_is_invalid_transition() {
        let task = ProcessTask::builder("sleep").arg("30").build().unwrap();
        task.start(context()).await.unwrap();
        let err = task.start(context()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        task.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_on_unreachable_bus_fails() {
        let task = ProcessTask::builder("sleep")
            .arg("30")
            .wait_for("org.bustest.Never")
            .build()
            .unwrap();
        task.start(context()).await.unwrap();
        assert_eq!(wait_until_terminal(&task).await, TaskState::Error);
        assert_eq!(task.failure().unwrap().kind, ErrorKind::LaunchFailed);
    }
}
