//! Child process supervision shared by process-backed tasks.
//!
//! [`launch`] spawns the child and hands it to a monitor task that owns it
//! until exit. The monitor is the only place that moves a process-backed
//! task past Started.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bustest_core::TaskState;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{ReturnPolicy, TaskContext, TaskStatus};
use crate::child::{self, Termination};
use crate::error::{BusTestError, ErrorKind, TaskFailure};

/// Grace used when the monitor itself has to take a child down.
const INTERNAL_GRACE: Duration = Duration::from_secs(2);

/// Runs once the wait-for name is owned, before the task is published as
/// Running. An error puts the task in Error instead.
pub(crate) type ReadyHook =
    Box<dyn FnOnce(zbus::Connection) -> BoxFuture<'static, Result<(), TaskFailure>> + Send>;

/// Runs after the child is gone. The flag is true when the exit was
/// requested through [`Monitor::stop`].
pub(crate) type ExitHook = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// What to run and how to tell it is ready.
pub(crate) struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub wait_for: Option<String>,
    pub return_policy: ReturnPolicy,
    pub ready_timeout: Option<Duration>,
    pub on_ready: Option<ReadyHook>,
    pub on_exit: Option<ExitHook>,
}

impl LaunchSpec {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            wait_for: None,
            return_policy: ReturnPolicy::Normal,
            ready_timeout: None,
            on_ready: None,
            on_exit: None,
        }
    }
}

/// Handle to a running monitor.
pub(crate) struct Monitor {
    stop_tx: oneshot::Sender<Duration>,
    join: JoinHandle<()>,
}

impl Monitor {
    /// Ask the monitor to terminate the child and wait for it to finish.
    pub(crate) async fn stop(self, grace: Duration) {
        // Fails only if the monitor already exited on its own.
        let _ = self.stop_tx.send(grace);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "task monitor panicked");
        }
    }
}

/// Spawn the child described by `spec` and start supervising it.
///
/// Moves the task to Started. On spawn failure the task goes to Error with
/// `LaunchFailed` and the error is returned.
pub(crate) fn launch(
    status: &Arc<TaskStatus>,
    ctx: &TaskContext,
    spec: LaunchSpec,
) -> Result<Monitor, BusTestError> {
    status.attach(&ctx.notifier);
    status.advance(TaskState::Started)?;

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(ctx.environment())
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = BusTestError::LaunchFailed {
                task: status.name().clone(),
                reason: format!("failed to spawn '{}': {e}", spec.program),
            };
            status.fail(TaskFailure::from(&err));
            return Err(err);
        }
    };
    tracing::info!(
        task = %status.name(),
        program = %spec.program,
        pid = ?child.id(),
        "task process started"
    );

    let task_name = status.name().to_string();
    if let Some(stdout) = child.stdout.take() {
        child::forward_lines(stdout, task_name.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        child::forward_lines(stderr, task_name, "stderr");
    }

    let LaunchSpec {
        wait_for,
        return_policy,
        ready_timeout,
        on_ready,
        on_exit,
        ..
    } = spec;

    let ready = if wait_for.is_none() && on_ready.is_none() {
        status.advance(TaskState::Running)?;
        None
    } else {
        let address = ctx.bus_address.clone();
        let fut = become_ready(address, wait_for, on_ready);
        Some(match ready_timeout {
            Some(limit) => async move {
                tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                    Err(TaskFailure::new(
                        ErrorKind::Timeout,
                        format!("not ready within {limit:?}"),
                    ))
                })
            }
            .boxed(),
            None => fut.boxed(),
        })
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    let join = tokio::spawn(supervise(
        Arc::clone(status),
        child,
        ready,
        return_policy,
        stop_rx,
        on_exit,
    ));
    Ok(Monitor { stop_tx, join })
}

async fn become_ready(
    address: String,
    wait_for: Option<String>,
    on_ready: Option<ReadyHook>,
) -> Result<(), TaskFailure> {
    let connection = crate::bus::connect(&address)
        .await
        .map_err(|e| TaskFailure::new(ErrorKind::LaunchFailed, e.to_string()))?;
    if let Some(name) = wait_for {
        crate::bus::wait_for_name(&connection, &name)
            .await
            .map_err(|e| TaskFailure::new(ErrorKind::LaunchFailed, e.to_string()))?;
    }
    if let Some(hook) = on_ready {
        hook(connection).await?;
    }
    Ok(())
}

async fn supervise(
    status: Arc<TaskStatus>,
    mut child: Child,
    ready: Option<BoxFuture<'static, Result<(), TaskFailure>>>,
    policy: ReturnPolicy,
    mut stop_rx: oneshot::Receiver<Duration>,
    on_exit: Option<ExitHook>,
) {
    let mut ready_done = ready.is_none();
    let mut ready = ready.unwrap_or_else(|| futures::future::pending().boxed());
    let requested = loop {
        tokio::select! {
            biased;
            result = &mut ready, if !ready_done => {
                ready_done = true;
                match result {
                    Ok(()) => {
                        if let Err(e) = status.advance(TaskState::Running) {
                            tracing::debug!(task = %status.name(), error = %e, "readiness ignored");
                        } else {
                            tracing::info!(task = %status.name(), "task running");
                        }
                    }
                    Err(failure) => {
                        status.fail(failure);
                        abandon(&status, &mut child, INTERNAL_GRACE).await;
                        break false;
                    }
                }
            }
            exit = child.wait() => {
                on_child_exit(&status, exit, policy);
                break false;
            }
            grace = &mut stop_rx => {
                let grace = grace.unwrap_or(INTERNAL_GRACE);
                on_stop(&status, &mut child, grace).await;
                break true;
            }
        }
    };
    if let Some(hook) = on_exit {
        hook(requested).await;
    }
}

fn on_child_exit(
    status: &TaskStatus,
    exit: std::io::Result<std::process::ExitStatus>,
    policy: ReturnPolicy,
) {
    let exit_status = match exit {
        Ok(exit_status) => exit_status,
        Err(e) => {
            status.fail(TaskFailure::new(
                ErrorKind::BackendUnreachable,
                format!("failed to wait for process: {e}"),
            ));
            return;
        }
    };
    match status.get() {
        TaskState::Started => {
            status.fail(TaskFailure::new(
                ErrorKind::LaunchFailed,
                format!("exited before becoming ready ({exit_status})"),
            ));
        }
        TaskState::Running if policy.accepts(exit_status) => {
            tracing::info!(task = %status.name(), %exit_status, "task process exited");
            let _ = status.advance(TaskState::Finished);
        }
        TaskState::Running => {
            status.fail(TaskFailure::new(
                ErrorKind::BackendUnreachable,
                format!("process exited unexpectedly ({exit_status})"),
            ));
        }
        _ => {}
    }
}

/// Take down a child whose task already failed. The recorded failure stands;
/// termination problems are only logged.
async fn abandon(status: &TaskStatus, child: &mut Child, grace: Duration) -> Option<Termination> {
    match child::terminate(child, grace).await {
        Ok(termination) => {
            match &termination {
                Termination::Graceful(exit_status) => {
                    tracing::debug!(task = %status.name(), %exit_status, "abandoned process exited");
                }
                Termination::Forced => {
                    tracing::warn!(task = %status.name(), ?grace, "abandoned process killed");
                }
            }
            Some(termination)
        }
        Err(e) => {
            tracing::warn!(task = %status.name(), error = %e, "failed to terminate abandoned process");
            None
        }
    }
}

async fn on_stop(status: &TaskStatus, child: &mut Child, grace: Duration) {
    match child::terminate(child, grace).await {
        Ok(Termination::Graceful(exit_status)) => {
            tracing::info!(task = %status.name(), %exit_status, "task stopped");
            let _ = status.advance(TaskState::Finished);
        }
        Ok(Termination::Forced) => {
            status.fail(TaskFailure::new(
                ErrorKind::Timeout,
                format!("killed after {grace:?} grace period"),
            ));
        }
        Err(e) => {
            status.fail(TaskFailure::new(
                ErrorKind::BackendUnreachable,
                format!("failed to stop process: {e}"),
            ));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bustest_core::TaskName;

    fn failed_status() -> TaskStatus {
        let status = TaskStatus::new(TaskName::from("abandoned"));
        status.advance(TaskState::Started).unwrap();
        assert!(status.fail(TaskFailure::new(ErrorKind::Timeout, "never became ready")));
        status
    }

    #[tokio::test]
    async fn test_abandon_terminates_child_and_keeps_failure() {
        let status = failed_status();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let termination = abandon(&status, &mut child, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(termination, Termination::Graceful(_)));
        assert!(child.try_wait().unwrap().is_some());
        assert_eq!(status.get(), TaskState::Error);
        assert_eq!(status.failure().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_abandon_forces_stubborn_child() {
        let status = failed_status();
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let termination = abandon(&status, &mut child, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(termination, Termination::Forced));
        assert_eq!(status.failure().unwrap().message, "never became ready");
    }
}
