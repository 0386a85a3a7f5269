//! The service: one private bus plus the tasks that run against it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bustest_core::{TaskName, TaskState};

use crate::bus::BusHandle;
use crate::config::{ServiceConfig, validate_conf_file};
use crate::error::BusTestError;
use crate::readiness::{TransitionNotifier, WaitOutcome, wait_for_tasks};
use crate::task::{BusTask, TaskContext, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configuring,
    Started,
    ShutDown,
}

struct TaskEntry {
    priority: TaskPriority,
    task: Arc<dyn BusTask>,
}

/// Owns the private bus and drives the lifecycle of every added task.
///
/// Tasks are added while configuring, started together by
/// [`start_tasks`](Self::start_tasks), awaited with
/// [`wait_for_running`](Self::wait_for_running) and torn down in reverse
/// order by [`shutdown`](Self::shutdown).
pub struct Service {
    config: ServiceConfig,
    bus: Option<BusHandle>,
    tasks: Vec<TaskEntry>,
    notifier: TransitionNotifier,
    phase: Phase,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("phase", &self.phase)
            .field("bus", &self.bus)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn new(config: ServiceConfig) -> Result<Self, BusTestError> {
        config.validate()?;
        Ok(Self {
            config,
            bus: None,
            tasks: Vec::new(),
            notifier: TransitionNotifier::new(),
            phase: Phase::Configuring,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run the private bus with this daemon configuration file.
    pub fn set_conf_file(&mut self, path: impl Into<PathBuf>) -> Result<(), BusTestError> {
        self.ensure_configuring()?;
        let path = path.into();
        validate_conf_file(&path)?;
        self.config.bus.conf_file = Some(path);
        Ok(())
    }

    pub fn add_task<T>(&mut self, task: T) -> Result<(), BusTestError>
    where
        T: BusTask + 'static,
    {
        self.add_task_with_priority(task, TaskPriority::Normal)
    }

    pub fn add_task_with_priority<T>(
        &mut self,
        task: T,
        priority: TaskPriority,
    ) -> Result<(), BusTestError>
    where
        T: BusTask + 'static,
    {
        self.ensure_configuring()?;
        tracing::debug!(task = %task.name(), ?priority, "task added");
        self.tasks.push(TaskEntry {
            priority,
            task: Arc::new(task),
        });
        Ok(())
    }

    /// Names and current states of all tasks, in start order once started.
    pub fn task_states(&self) -> Vec<(TaskName, TaskState)> {
        self.tasks
            .iter()
            .map(|entry| (entry.task.name().clone(), entry.task.state()))
            .collect()
    }

    /// Launch the bus, then start every task without waiting for readiness.
    ///
    /// Only a bus that cannot be brought up is an error here. Tasks that fail
    /// to launch are left in Error for [`wait_for_running`](Self::wait_for_running)
    /// to report. A second call does nothing.
    pub async fn start_tasks(&mut self) -> Result<(), BusTestError> {
        match self.phase {
            Phase::Configuring => {}
            Phase::Started => return Ok(()),
            Phase::ShutDown => return Err(BusTestError::TaskSetClosed),
        }

        let bus = BusHandle::launch(&self.config.bus).await?;
        let ctx = TaskContext {
            bus_address: bus.address().to_string(),
            bus_type: bus.bus_type(),
            notifier: self.notifier.clone(),
            mock_backend: self.config.mock.clone(),
        };
        self.bus = Some(bus);
        self.phase = Phase::Started;

        self.tasks.sort_by_key(|entry| entry.priority);
        for entry in &self.tasks {
            let task = &entry.task;
            match task.start(ctx.clone()).await {
                Ok(()) => tracing::debug!(task = %task.name(), "task launched"),
                Err(e) => tracing::warn!(task = %task.name(), error = %e, "task failed to launch"),
            }
        }
        Ok(())
    }

    /// Wait until every task is Running, one is in Error, or `timeout`
    /// elapses. Task states are not changed.
    pub async fn wait_for_running(&self, timeout: Duration) -> WaitOutcome {
        let tasks: Vec<Arc<dyn BusTask>> = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(&entry.task))
            .collect();
        let outcome = wait_for_tasks(&tasks, &self.notifier, timeout).await;
        match &outcome {
            WaitOutcome::Running => tracing::info!(tasks = tasks.len(), "all tasks running"),
            WaitOutcome::TaskFailed { task, failure } => {
                tracing::warn!(task = %task, failure = ?failure, "task failed before running");
            }
            WaitOutcome::TimedOut { pending } => {
                tracing::warn!(?pending, ?timeout, "timed out waiting for tasks");
            }
        }
        outcome
    }

    /// [`start_tasks`](Self::start_tasks) followed by
    /// [`wait_for_running`](Self::wait_for_running).
    pub async fn start_and_wait(&mut self, timeout: Duration) -> Result<(), BusTestError> {
        let started = tokio::time::Instant::now();
        self.start_tasks().await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        self.wait_for_running(remaining)
            .await
            .into_result(started.elapsed())
    }

    /// Stop all tasks in reverse start order, then the bus.
    ///
    /// Best effort and idempotent: failures are logged and the first one is
    /// returned after everything has been torn down.
    pub async fn shutdown(&mut self) -> Result<(), BusTestError> {
        if self.phase == Phase::ShutDown {
            return Ok(());
        }
        self.phase = Phase::ShutDown;

        let grace = self.config.shutdown_grace();
        let mut first_error = None;
        for entry in self.tasks.iter().rev() {
            let task = &entry.task;
            match task.stop(grace).await {
                Ok(state) => tracing::debug!(task = %task.name(), %state, "task stopped"),
                Err(e) => {
                    tracing::warn!(task = %task.name(), error = %e, "failed to stop task");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(bus) = self.bus.take()
            && let Err(e) = bus.shutdown(grace).await
        {
            tracing::warn!(error = %e, "failed to stop private bus");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Address of the private bus while it is running.
    pub fn bus_address(&self) -> Option<&str> {
        self.bus.as_ref().map(BusHandle::address)
    }

    /// Environment a client process needs to use the private bus.
    pub fn bus_environment(&self) -> Option<Vec<(String, String)>> {
        self.bus.as_ref().map(BusHandle::environment)
    }

    /// New client connection to the private bus.
    pub async fn connect(&self) -> Result<zbus::Connection, BusTestError> {
        match &self.bus {
            Some(bus) => bus.connect().await,
            None => Err(BusTestError::BackendUnreachable(
                "private bus is not running".to_string(),
            )),
        }
    }

    fn ensure_configuring(&self) -> Result<(), BusTestError> {
        if self.phase == Phase::Configuring {
            Ok(())
        } else {
            Err(BusTestError::TaskSetClosed)
        }
    }
}
